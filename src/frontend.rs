//! The content-side context of one window.
//!
//! A frontend runtime owns its own [`LifecycleController`] and talks to the
//! backend only through messages: config reads go over the config channel,
//! lifecycle decisions arrive as [`ContextMessage`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::broadcast::{ContextMessage, PeerEndpoint, StateSnapshot};
use crate::catalog::{config_enabled, PluginCatalog};
use crate::channel::ConfigSource;
use crate::console::SharedConsole;
use crate::lifecycle::{LifecycleController, LifecycleError, PendingTransition, Transition};
use crate::plugin_api::{ContextKind, HostWindow, WindowId};

pub struct FrontendRuntime {
    window: Arc<dyn HostWindow>,
    controller: LifecycleController,
    content_ready: AtomicBool,
}

impl FrontendRuntime {
    pub fn new(
        window: Arc<dyn HostWindow>,
        catalog: Arc<PluginCatalog>,
        config: Arc<dyn ConfigSource>,
        console: SharedConsole,
    ) -> Arc<Self> {
        let controller = LifecycleController::new(ContextKind::Frontend, catalog, config, console);
        controller.attach_window(window.clone());
        Arc::new(Self {
            window,
            controller,
            content_ready: AtomicBool::new(false),
        })
    }

    pub fn window(&self) -> WindowId {
        self.window.id()
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    pub fn active_plugins(&self) -> Vec<String> {
        self.controller.active_plugins(self.window())
    }

    /// Load what the snapshot says is enabled, in catalog order.
    pub async fn start(&self, snapshot: &StateSnapshot) -> Vec<(String, Result<Transition, LifecycleError>)> {
        let window = self.window();
        let pending: Vec<PendingTransition> = self
            .controller
            .catalog()
            .list_ids()
            .iter()
            .filter(|id| snapshot.config(id).is_some_and(config_enabled))
            .map(|id| self.controller.enqueue_load(id, window))
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for p in pending {
            let id = p.plugin_id().to_string();
            let result = p.wait().await;
            if let Err(e) = &result {
                log::error!("Frontend load of '{}' in {} failed: {}", id, window, e);
            }
            results.push((id, result));
        }
        results
    }

    /// Queue the transitions a message calls for. Nothing is awaited, so a
    /// slow plugin never holds up the next message.
    pub fn dispatch(&self, message: &ContextMessage) -> Vec<PendingTransition> {
        let window = self.window();
        match message {
            ContextMessage::PluginEnable { id } => {
                let mut pending = vec![self.controller.enqueue_force_load(id, window)];
                if self.content_ready.load(Ordering::SeqCst) {
                    pending.push(self.controller.content_ready_for(id, window));
                }
                pending
            }
            ContextMessage::PluginUnload { id } => {
                vec![self.controller.enqueue_force_unload(id, window)]
            }
            ContextMessage::ConfigChanged { id, config } => {
                // Instances not yet active skip it and read fresh config on load.
                if config_enabled(config) {
                    vec![self.controller.enqueue_reconfigure(id, window, config.clone())]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Apply messages from `endpoint` until the broadcaster drops it.
    pub async fn run(self: Arc<Self>, mut endpoint: PeerEndpoint) {
        while let Some(envelope) = endpoint.recv().await {
            log::trace!("{} <- {} #{}", self.window(), envelope.message, envelope.seq);
            let pending = self.dispatch(&envelope.message);
            if pending.is_empty() {
                continue;
            }
            tokio::spawn(async move {
                for p in pending {
                    let label = format!("'{}' in {}", p.plugin_id(), p.window());
                    if let Err(e) = p.wait().await {
                        log::error!("Frontend transition of {} failed: {}", label, e);
                    }
                }
            });
        }
        log::debug!("{} stopped receiving broadcasts", self.window());
    }

    /// The window's content finished loading: notify every active instance
    /// now, and every instance enabled later right after it loads.
    pub async fn mark_content_ready(&self) {
        self.content_ready.store(true, Ordering::SeqCst);
        for (id, result) in self.controller.content_ready(self.window()).await {
            if let Err(e) = result {
                log::warn!("'{}' failed to handle content ready: {}", id, e);
            }
        }
    }

    pub async fn close(&self) {
        self.controller.shutdown().await;
    }
}
