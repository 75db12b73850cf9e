use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use shell_core::{AppState, WindowId};

const HELP: &str = "\
commands:
  list                     plugins and whether they are enabled
  get <id>                 merged config of a plugin
  set <id> <json>          merge a JSON object into a plugin's config
  enable <id> | disable <id>
  option <path> <json>     write any config value, e.g. option options.tray true
  resize <width> <height>  resize the main window (debounced)
  open | close <n>         open or close a window
  windows                  open windows and their active plugins
  journal [all|clear]      lifecycle history since the last call, all of it, or wipe it
  quit";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let app = AppState::new().context("failed to initialise the shell")?;
    app.start_flush_ticker();

    let main_window = app.open_window().await;
    if let Some(frontend) = app.frontend(main_window) {
        frontend.mark_content_ready().await;
    }

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match run_command(&app, main_window, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("error: {:#}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    app.shutdown().await;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn run_command(app: &AppState, main_window: WindowId, line: &str) -> Result<bool> {
    let mut parts = line.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let first = parts.next().map(str::trim);
    let rest = parts.next().map(str::trim);

    match (command, first, rest) {
        ("", _, _) => {}
        ("help", _, _) => println!("{}", HELP),
        ("quit" | "exit", _, _) => return Ok(false),
        ("list", _, _) => {
            let tree = app.config.snapshot();
            for info in app.service.plugins() {
                let enabled = app.catalog.is_enabled(&info.id, &tree);
                let restart = if info.restart_required { " (restart required)" } else { "" };
                println!(
                    "[{}] {:<14} {}{}",
                    if enabled { "x" } else { " " },
                    info.id,
                    info.name,
                    restart
                );
            }
        }
        ("get", Some(id), _) => {
            let config = app.service.get_config(id)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ("set", Some(id), Some(raw)) => {
            let partial: Value = serde_json::from_str(raw).context("invalid JSON")?;
            app.service.set_config(id, partial)?;
        }
        ("enable", Some(id), _) => app.service.set_config(id, json!({ "enabled": true }))?,
        ("disable", Some(id), _) => app.service.set_config(id, json!({ "enabled": false }))?,
        ("option", Some(path), Some(raw)) => {
            let value: Value = serde_json::from_str(raw).context("invalid JSON")?;
            app.config.set_debounced(path, value)?;
        }
        ("resize", Some(width), Some(height)) => {
            let width: u32 = width.parse().context("width must be a number")?;
            let height: u32 = height.parse().context("height must be a number")?;
            app.config
                .set_debounced("window-size", json!({ "width": width, "height": height }))?;
        }
        ("open", _, _) => {
            let id = app.open_window().await;
            if let Some(frontend) = app.frontend(id) {
                frontend.mark_content_ready().await;
            }
            println!("opened {}", id);
        }
        ("close", Some(n), _) => {
            let id = WindowId(n.parse().context("window number expected")?);
            if id == main_window {
                bail!("the main window closes with `quit`");
            }
            if !app.close_window(id).await {
                bail!("{} is not open", id);
            }
        }
        ("windows", _, _) => {
            for id in app.open_windows() {
                let frontend = app
                    .frontend(id)
                    .map(|f| f.active_plugins())
                    .unwrap_or_default();
                println!(
                    "{}: backend {:?}, frontend {:?}",
                    id,
                    app.backend.active_plugins(id),
                    frontend
                );
            }
        }
        ("journal", Some("clear"), _) => app.console.write().clear(),
        ("journal", Some("all"), _) => {
            print!("{}", app.console.read().render());
        }
        ("journal", _, _) => {
            for entry in app.console.write().get_new_entries() {
                println!("[{}] {}", entry.at.format("%H:%M:%S"), entry.entry);
            }
        }
        _ => bail!("unrecognised command '{}', try `help`", line),
    }
    Ok(true)
}
