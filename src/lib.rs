pub mod broadcast;
pub mod builtin;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod console;
pub mod detector;
pub mod frontend;
pub mod lifecycle;
pub mod merge;
pub mod plugin_api;
pub mod restart;
pub mod sync;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub use broadcast::{ContextMessage, CrossContextBroadcaster};
pub use catalog::{PluginCatalog, PluginDefinition};
pub use channel::{ConfigService, ConfigSource};
pub use config::{ConfigStore, PersistBackend, ShellDefaults, TomlFileBackend};
pub use console::{ConsoleLog, SharedConsole};
pub use frontend::FrontendRuntime;
pub use lifecycle::{LifecycleController, LifecycleError, Transition};
pub use plugin_api::{ContextKind, PluginUnit, WindowId};
pub use restart::{RestartAdvisor, RestartPrompt, Relauncher};
pub use sync::SyncEngine;

use broadcast::PeerId;
use plugin_api::HeadlessWindow;
use restart::{LogPrompt, ProcessRelauncher};

pub const APP_NAME: &str = "shell-host";

/// How often staged window-geometry writes are checked.
const FLUSH_TICK: Duration = Duration::from_millis(100);

struct OpenWindow {
    frontend: Arc<FrontendRuntime>,
    peer: PeerId,
    receiver: JoinHandle<()>,
}

/// Main application state
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub catalog: Arc<PluginCatalog>,
    pub console: SharedConsole,
    pub service: Arc<ConfigService>,
    pub backend: Arc<LifecycleController>,
    pub broadcaster: Arc<CrossContextBroadcaster>,
    pub advisor: Arc<RestartAdvisor>,
    pub sync: Arc<SyncEngine>,
    windows: Mutex<BTreeMap<WindowId, OpenWindow>>,
    next_window: AtomicU32,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// State backed by the user's config file and the bundled plugins.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Result<Self> {
        let backend = TomlFileBackend::in_config_dir(APP_NAME)?;
        log::info!("Using configuration at {}", backend.path().display());
        Ok(Self::with_parts(
            backend,
            builtin::catalog()?,
            Arc::new(LogPrompt),
            Arc::new(ProcessRelauncher),
        ))
    }

    pub fn with_parts(
        persist: impl PersistBackend + 'static,
        catalog: PluginCatalog,
        prompt: Arc<dyn RestartPrompt>,
        relauncher: Arc<dyn Relauncher>,
    ) -> Self {
        let mut defaults = ShellDefaults::default().to_tree();
        if let Some(root) = defaults.as_object_mut() {
            root.insert(
                "plugins".to_string(),
                serde_json::Value::Object(catalog.merged_all(&serde_json::Value::Null)),
            );
        }
        let config = Arc::new(ConfigStore::open(persist, defaults));
        let catalog = Arc::new(catalog);

        let console = Arc::new(RwLock::new(ConsoleLog::new()));
        let console_enabled = config
            .get_as::<bool>("options.consoleEnabled")
            .ok()
            .flatten()
            .unwrap_or(true);
        console.write().set_enabled(console_enabled);
        {
            let console = console.clone();
            config.watch(move |new, old| {
                let flag = |tree: &crate::config::Snapshot| {
                    tree.pointer("/options/consoleEnabled").and_then(serde_json::Value::as_bool)
                };
                if flag(new) != flag(old) {
                    console.write().set_enabled(flag(new).unwrap_or(true));
                }
            });
        }

        let service = Arc::new(ConfigService::new(config.clone(), catalog.clone()));
        let backend = Arc::new(LifecycleController::new(
            ContextKind::Backend,
            catalog.clone(),
            service.clone(),
            console.clone(),
        ));

        let broadcaster = {
            let config = config.clone();
            let catalog = catalog.clone();
            Arc::new(CrossContextBroadcaster::new(
                move || catalog.merged_all(&config.snapshot()),
                console.clone(),
            ))
        };

        let advisor = Arc::new(RestartAdvisor::new(
            catalog.clone(),
            config.clone(),
            prompt,
            relauncher,
            console.clone(),
        ));

        let sync = SyncEngine::attach(
            config.clone(),
            catalog.clone(),
            backend.clone(),
            broadcaster.clone(),
            advisor.clone(),
        );

        console
            .write()
            .log_info(&format!("Shell ready with {} plugin(s)", catalog.len()));

        Self {
            config,
            catalog,
            console,
            service,
            backend,
            broadcaster,
            advisor,
            sync,
            windows: Mutex::new(BTreeMap::new()),
            next_window: AtomicU32::new(1),
            ticker: Mutex::new(None),
        }
    }

    /// Commit due debounced writes every 100 ms until shutdown.
    pub fn start_flush_ticker(&self) {
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_TICK);
            loop {
                interval.tick().await;
                if let Err(e) = config.flush_due() {
                    log::error!("Failed to persist window state: {}", e);
                }
            }
        });
        if let Some(previous) = self.ticker.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Open a window: attach it to the backend, connect its frontend
    /// context, and load every enabled plugin on both sides.
    pub async fn open_window(&self) -> WindowId {
        let id = WindowId(self.next_window.fetch_add(1, Ordering::SeqCst));
        let window = HeadlessWindow::new(id);
        self.backend.attach_window(window.clone());

        let (endpoint, snapshot) = self.broadcaster.connect();
        let peer = endpoint.id();
        let frontend = FrontendRuntime::new(
            window,
            self.catalog.clone(),
            Arc::new(self.service.client()),
            self.console.clone(),
        );

        self.backend.load_enabled(id).await;
        frontend.start(&snapshot).await;
        let receiver = tokio::spawn(frontend.clone().run(endpoint));

        self.windows.lock().insert(
            id,
            OpenWindow {
                frontend,
                peer,
                receiver,
            },
        );
        self.console.write().log_info(&format!("Opened {}", id));
        id
    }

    pub fn frontend(&self, id: WindowId) -> Option<Arc<FrontendRuntime>> {
        self.windows.lock().get(&id).map(|w| w.frontend.clone())
    }

    pub fn open_windows(&self) -> Vec<WindowId> {
        self.windows.lock().keys().copied().collect()
    }

    /// Close a window, unloading everything bound to it on both sides.
    pub async fn close_window(&self, id: WindowId) -> bool {
        let Some(window) = self.windows.lock().remove(&id) else {
            return false;
        };
        self.broadcaster.disconnect(window.peer);
        let _ = window.receiver.await;
        window.frontend.close().await;

        for (plugin_id, result) in self.backend.detach_window(id).await {
            if let Err(e) = result {
                log::warn!("Error unloading '{}' from {}: {}", plugin_id, id, e);
            }
        }
        self.console.write().log_info(&format!("Closed {}", id));
        true
    }

    /// Stop everything and persist whatever is still staged.
    pub async fn shutdown(&self) {
        self.advisor.begin_shutdown();
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }

        for id in self.open_windows() {
            self.close_window(id).await;
        }
        self.backend.shutdown().await;
        self.sync.settle().await;

        if let Err(e) = self.config.flush() {
            log::error!("Failed to save configuration on shutdown: {}", e);
        }
        self.sync.detach();
        log::info!("Shutdown complete");
    }
}
