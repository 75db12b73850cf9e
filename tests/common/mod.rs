#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shell_core::broadcast::{Envelope, PeerEndpoint};
use shell_core::config::MemoryBackend;
use shell_core::plugin_api::{PluginContext, PluginHooks, Teardown};
use shell_core::restart::{RestartChoice, RestartDialog};
use shell_core::{AppState, PluginCatalog, PluginDefinition, PluginUnit, RestartPrompt, Relauncher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type Events = Arc<Mutex<Vec<String>>>;

pub struct Recorder {
    tag: &'static str,
    events: Events,
}

#[async_trait]
impl PluginHooks for Recorder {
    async fn start(&mut self, ctx: PluginContext, _config: Value) -> anyhow::Result<()> {
        self.events
            .lock()
            .push(format!("{}:{}:start:{}", self.tag, ctx.context(), ctx.window().id().0));
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.events.lock().push(format!("{}:stop", self.tag));
        Ok(())
    }

    async fn on_config_change(&mut self, config: Value) -> anyhow::Result<()> {
        self.events
            .lock()
            .push(format!("{}:config:{}", self.tag, config["level"]));
        Ok(())
    }
}

pub struct ScriptedPrompt {
    pub choice: RestartChoice,
    pub asked: Mutex<Vec<RestartDialog>>,
}

#[async_trait]
impl RestartPrompt for ScriptedPrompt {
    async fn ask(&self, dialog: &RestartDialog) -> RestartChoice {
        self.asked.lock().push(dialog.clone());
        self.choice
    }
}

#[derive(Default)]
pub struct CountingRelauncher {
    pub calls: AtomicUsize,
}

impl Relauncher for CountingRelauncher {
    fn relaunch(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub app: AppState,
    pub events: Events,
    pub prompt: Arc<ScriptedPrompt>,
    pub relauncher: Arc<CountingRelauncher>,
    pub persisted: MemoryBackend,
}

impl Harness {
    pub fn starts(&self, tag: &str) -> usize {
        let prefix = format!("{}:backend:start", tag);
        self.events.lock().iter().filter(|e| e.starts_with(&prefix)).count()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

fn recording_catalog(events: &Events) -> PluginCatalog {
    let shortcut_events = events.clone();
    let shortcut_frontend = events.clone();
    let menu_events = events.clone();
    let fragile_events = events.clone();

    PluginCatalog::new(vec![
        PluginDefinition::builder("shortcuts", "Shortcuts")
            .default_config(json!({ "level": 1 }))
            .backend(PluginUnit::hooks(move || Recorder {
                tag: "shortcuts",
                events: shortcut_events.clone(),
            }))
            .frontend(PluginUnit::hooks(move || Recorder {
                tag: "shortcuts",
                events: shortcut_frontend.clone(),
            }))
            .build()
            .unwrap(),
        PluginDefinition::builder("in-app-menu", "In-App Menu")
            .restart_required(true)
            .backend(PluginUnit::hooks(move || Recorder {
                tag: "in-app-menu",
                events: menu_events.clone(),
            }))
            .build()
            .unwrap(),
        // Teardown in window 1 panics.
        PluginDefinition::builder("fragile", "Fragile")
            .backend(PluginUnit::function(move |ctx, _config| {
                let events = fragile_events.clone();
                async move {
                    let window = ctx.window().id().0;
                    events.lock().push(format!("fragile:backend:start:{}", window));
                    Ok(Some(Box::new(move || {
                        if window == 1 {
                            panic!("teardown crashed");
                        }
                        events.lock().push(format!("fragile:stop:{}", window));
                        Ok(())
                    }) as Teardown))
                }
            }))
            .build()
            .unwrap(),
    ])
    .unwrap()
}

pub fn harness_with(choice: RestartChoice, stored: Value) -> Harness {
    let events: Events = Arc::default();
    let persisted = MemoryBackend::with_document(stored);
    let prompt = Arc::new(ScriptedPrompt {
        choice,
        asked: Mutex::new(Vec::new()),
    });
    let relauncher = Arc::new(CountingRelauncher::default());
    let app = AppState::with_parts(
        persisted.clone(),
        recording_catalog(&events),
        prompt.clone(),
        relauncher.clone(),
    );
    Harness {
        app,
        events,
        prompt,
        relauncher,
        persisted,
    }
}

pub fn harness() -> Harness {
    harness_with(RestartChoice::Later, json!({}))
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn drain(endpoint: &mut PeerEndpoint) -> Vec<Envelope> {
    std::iter::from_fn(|| endpoint.try_recv()).collect()
}
