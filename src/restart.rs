//! Asking the user to relaunch after a restart-required plugin changed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::catalog::PluginCatalog;
use crate::config::ConfigStore;
use crate::console::SharedConsole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartChoice {
    RestartNow,
    Later,
}

/// Contents of the restart question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartDialog {
    pub title: String,
    pub message: String,
    pub detail: String,
    pub buttons: Vec<String>,
    /// Index of the button chosen on Enter.
    pub default_button: usize,
    /// Index of the button chosen on Escape / dismissal.
    pub cancel_button: usize,
}

impl RestartDialog {
    pub fn for_plugin(name: &str) -> Self {
        Self {
            title: "Restart Required".to_string(),
            message: format!("\"{}\" needs to restart", name),
            detail: format!("\"{}\" plugin requires a restart to take effect", name),
            buttons: vec!["Restart Now".to_string(), "Later".to_string()],
            default_button: 0,
            cancel_button: 1,
        }
    }

    /// Map a pressed button index to a choice. Anything but the first
    /// button counts as "later".
    pub fn choice_for(&self, button: usize) -> RestartChoice {
        if button == 0 {
            RestartChoice::RestartNow
        } else {
            RestartChoice::Later
        }
    }
}

/// Surface that shows the dialog and waits for an answer.
#[async_trait]
pub trait RestartPrompt: Send + Sync {
    async fn ask(&self, dialog: &RestartDialog) -> RestartChoice;
}

/// Prompt for hosts without an interactive surface: logs the dialog and
/// always defers.
pub struct LogPrompt;

#[async_trait]
impl RestartPrompt for LogPrompt {
    async fn ask(&self, dialog: &RestartDialog) -> RestartChoice {
        log::warn!("{}: {} ({})", dialog.title, dialog.message, dialog.detail);
        RestartChoice::Later
    }
}

pub trait Relauncher: Send + Sync {
    /// Start a fresh copy of the process and end this one. Only returns on
    /// failure.
    fn relaunch(&self) -> anyhow::Result<()>;
}

/// Re-executes the current binary with the same arguments, then exits 0.
pub struct ProcessRelauncher;

impl Relauncher for ProcessRelauncher {
    fn relaunch(&self) -> anyhow::Result<()> {
        let exe = std::env::current_exe()?;
        let args: Vec<String> = std::env::args().skip(1).collect();
        log::info!("Relaunching {} {:?}", exe.display(), args);
        Command::new(exe).args(args).spawn()?;
        std::process::exit(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdviceOutcome {
    /// The user chose, and the choice was acted on.
    Answered(RestartChoice),
    /// A prompt for this plugin is already open.
    Coalesced,
    ShuttingDown,
    UnknownPlugin,
    /// "Restart Now" was chosen but the relaunch failed.
    RelaunchFailed,
}

pub struct RestartAdvisor {
    catalog: Arc<PluginCatalog>,
    store: Arc<ConfigStore>,
    prompt: Arc<dyn RestartPrompt>,
    relauncher: Arc<dyn Relauncher>,
    console: SharedConsole,
    pending: Mutex<HashSet<String>>,
    shutting_down: AtomicBool,
}

impl RestartAdvisor {
    pub fn new(
        catalog: Arc<PluginCatalog>,
        store: Arc<ConfigStore>,
        prompt: Arc<dyn RestartPrompt>,
        relauncher: Arc<dyn Relauncher>,
        console: SharedConsole,
    ) -> Self {
        Self {
            catalog,
            store,
            prompt,
            relauncher,
            console,
            pending: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Ask whether to restart for `plugin_id`.
    ///
    /// Choosing "later" leaves every instance exactly as the lifecycle
    /// controller set it.
    pub async fn advise(&self, plugin_id: &str) -> AdviceOutcome {
        if self.is_shutting_down() {
            return AdviceOutcome::ShuttingDown;
        }
        let Some(definition) = self.catalog.get(plugin_id) else {
            return AdviceOutcome::UnknownPlugin;
        };
        if !self.pending.lock().insert(plugin_id.to_string()) {
            return AdviceOutcome::Coalesced;
        }

        self.console.write().log_restart_advised(plugin_id);
        let dialog = RestartDialog::for_plugin(definition.name());
        let choice = self.prompt.ask(&dialog).await;
        self.pending.lock().remove(plugin_id);

        match choice {
            RestartChoice::Later => AdviceOutcome::Answered(RestartChoice::Later),
            RestartChoice::RestartNow => self.restart_now(),
        }
    }

    fn restart_now(&self) -> AdviceOutcome {
        self.begin_shutdown();
        // Window geometry may still be sitting in the debounce queue.
        if let Err(e) = self.store.flush() {
            log::error!("Failed to flush configuration before restart: {}", e);
        }

        match self.relauncher.relaunch() {
            Ok(()) => AdviceOutcome::Answered(RestartChoice::RestartNow),
            Err(e) => {
                self.shutting_down.store(false, Ordering::SeqCst);
                self.console
                    .write()
                    .log_error(&format!("Failed to restart: {:#}", e));
                AdviceOutcome::RelaunchFailed
            }
        }
    }
}
