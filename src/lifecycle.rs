//! Loading and unloading plugin units in one context.
//!
//! Every (plugin, window) pair gets a slot with its own worker task and
//! command queue. Commands are queued synchronously and processed in order,
//! so a second transition waits for the first to finish while other slots
//! keep moving. A plugin whose setup never returns only stalls its own slot.

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;

use crate::catalog::{config_enabled, PluginCatalog, PluginDefinition};
use crate::channel::{ChannelError, ConfigSource};
use crate::console::SharedConsole;
use crate::plugin_api::{
    ContextKind, HostWindow, PluginContext, PluginHooks, PluginUnit, WindowId,
};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("{0} is not attached")]
    UnknownWindow(WindowId),

    #[error("plugin '{plugin_id}' is already active in {window}")]
    AlreadyActive { plugin_id: String, window: WindowId },

    #[error("failed to activate plugin '{plugin_id}': {source:#}")]
    Activation {
        plugin_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("plugin '{plugin_id}' failed to tear down: {source:#}")]
    Teardown {
        plugin_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("plugin '{plugin_id}' failed to apply new config: {source:#}")]
    Reconfigure {
        plugin_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not read config for '{plugin_id}': {source}")]
    Config {
        plugin_id: String,
        #[source]
        source: ChannelError,
    },

    #[error("transition worker for '{0}' stopped")]
    WorkerClosed(String),
}

/// Where a (plugin, window) slot currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Unloaded,
    Loading,
    Active,
    Reconfiguring,
    Unloading,
}

/// What a completed transition did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Loaded,
    /// A forced load found the plugin active and restarted it.
    Reloaded,
    Unloaded,
    /// Unload requested on a slot with nothing loaded.
    AlreadyUnloaded,
    Reconfigured,
    /// The plugin has no unit for this context.
    NoUnit,
    /// The slot was not active, so the request did not apply.
    Skipped,
    /// Every earlier command on the slot has completed.
    Settled,
}

type HookFuture = BoxFuture<'static, anyhow::Result<()>>;
type AsyncTeardown = Box<dyn FnOnce() -> HookFuture + Send>;
type AsyncHook<A> = Box<dyn Fn(A) -> HookFuture + Send + Sync>;

/// Shape-independent handle kept for an active unit.
struct ActiveHandle {
    teardown: Option<AsyncTeardown>,
    reconfigure: Option<AsyncHook<Value>>,
    content_ready: Option<AsyncHook<()>>,
}

impl ActiveHandle {
    fn from_hooks(hooks: Box<dyn PluginHooks>) -> Self {
        let shared = Arc::new(tokio::sync::Mutex::new(hooks));

        let stop = shared.clone();
        let reconfigure = shared.clone();
        let content_ready = shared;
        Self {
            teardown: Some(Box::new(move || -> HookFuture {
                Box::pin(async move { stop.lock().await.stop().await })
            })),
            reconfigure: Some(Box::new(move |config: Value| -> HookFuture {
                let hooks = reconfigure.clone();
                Box::pin(async move { hooks.lock().await.on_config_change(config).await })
            })),
            content_ready: Some(Box::new(move |(): ()| -> HookFuture {
                let hooks = content_ready.clone();
                Box::pin(async move { hooks.lock().await.on_content_ready().await })
            })),
        }
    }
}

/// Run the unit's setup. The only place that looks at the unit's shape.
async fn start_unit(
    unit: PluginUnit,
    ctx: PluginContext,
    config: Value,
) -> anyhow::Result<ActiveHandle> {
    match unit {
        PluginUnit::Function(activate) => {
            let teardown = activate(ctx, config).await?;
            Ok(ActiveHandle {
                teardown: teardown.map(|cleanup| -> AsyncTeardown {
                    Box::new(move || -> HookFuture { Box::pin(async move { cleanup() }) })
                }),
                reconfigure: None,
                content_ready: None,
            })
        }
        PluginUnit::Hooks(factory) => {
            let mut hooks = factory();
            hooks.start(ctx, config).await?;
            Ok(ActiveHandle::from_hooks(hooks))
        }
    }
}

/// Plugin code runs on its own task so a panic surfaces as an error.
fn flatten<T>(joined: Result<anyhow::Result<T>, JoinError>) -> anyhow::Result<T> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow::anyhow!("plugin panicked: {}", e)),
        Err(e) => Err(anyhow::anyhow!("plugin task aborted: {}", e)),
    }
}

type Reply = oneshot::Sender<Result<Transition, LifecycleError>>;

enum SlotCommand {
    Load { force: bool, reply: Reply },
    Unload { reply: Reply },
    Reconfigure { config: Value, reply: Reply },
    ContentReady { reply: Reply },
    Barrier { reply: Reply },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    plugin_id: String,
    window: WindowId,
}

#[derive(Clone)]
struct SlotHandle {
    tx: mpsc::UnboundedSender<SlotCommand>,
    state: Arc<RwLock<InstanceState>>,
}

struct SlotWorker {
    plugin_id: String,
    context: ContextKind,
    definition: Arc<PluginDefinition>,
    window: Arc<dyn HostWindow>,
    config: Arc<dyn ConfigSource>,
    console: SharedConsole,
    state: Arc<RwLock<InstanceState>>,
    active: Option<ActiveHandle>,
}

impl SlotWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SlotCommand>) {
        while let Some(command) = rx.recv().await {
            // A caller that stopped waiting does not cancel the transition.
            match command {
                SlotCommand::Load { force, reply } => {
                    let _ = reply.send(self.load(force).await);
                }
                SlotCommand::Unload { reply } => {
                    let _ = reply.send(self.unload().await);
                }
                SlotCommand::Reconfigure { config, reply } => {
                    let _ = reply.send(self.reconfigure(config).await);
                }
                SlotCommand::ContentReady { reply } => {
                    let _ = reply.send(self.content_ready().await);
                }
                SlotCommand::Barrier { reply } => {
                    let _ = reply.send(Ok(Transition::Settled));
                }
            }
        }

        // Slot dropped by the controller: nothing may outlive it.
        if self.active.is_some() {
            let _ = self.deactivate().await;
        }
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.write() = state;
    }

    async fn load(&mut self, force: bool) -> Result<Transition, LifecycleError> {
        let mut outcome = Transition::Loaded;
        if self.active.is_some() {
            if !force {
                return Err(LifecycleError::AlreadyActive {
                    plugin_id: self.plugin_id.clone(),
                    window: self.window.id(),
                });
            }
            // A failed teardown must not block the fresh activation.
            let _ = self.deactivate().await;
            outcome = Transition::Reloaded;
        }

        self.set_state(InstanceState::Loading);
        let config = match self.config.get_config(&self.plugin_id).await {
            Ok(config) => config,
            Err(source) => {
                self.set_state(InstanceState::Unloaded);
                return Err(LifecycleError::Config {
                    plugin_id: self.plugin_id.clone(),
                    source,
                });
            }
        };

        let Some(unit) = self.definition.unit(self.context).cloned() else {
            self.set_state(InstanceState::Unloaded);
            return Ok(Transition::NoUnit);
        };
        let ctx = PluginContext::new(
            &self.plugin_id,
            self.context,
            self.window.clone(),
            self.config.clone(),
        );

        match flatten(tokio::spawn(start_unit(unit, ctx, config)).await) {
            Ok(handle) => {
                self.active = Some(handle);
                self.set_state(InstanceState::Active);
                self.console
                    .write()
                    .log_plugin_loaded(&self.plugin_id, self.context, self.window.id());
                Ok(outcome)
            }
            Err(source) => {
                self.set_state(InstanceState::Unloaded);
                self.console.write().log_error(&format!(
                    "Failed to load plugin '{}' ({}, {}): {:#}",
                    self.plugin_id,
                    self.context,
                    self.window.id(),
                    source
                ));
                Err(LifecycleError::Activation {
                    plugin_id: self.plugin_id.clone(),
                    source,
                })
            }
        }
    }

    async fn unload(&mut self) -> Result<Transition, LifecycleError> {
        if self.active.is_none() {
            return Ok(Transition::AlreadyUnloaded);
        }
        self.deactivate().await.map(|()| Transition::Unloaded)
    }

    /// Tear down the active unit. The slot ends up `Unloaded` whether or
    /// not the unit's own cleanup succeeded.
    async fn deactivate(&mut self) -> Result<(), LifecycleError> {
        let Some(handle) = self.active.take() else {
            return Ok(());
        };
        self.set_state(InstanceState::Unloading);

        let outcome = match handle.teardown {
            Some(teardown) => flatten(tokio::spawn(teardown()).await),
            None => Ok(()),
        };

        self.set_state(InstanceState::Unloaded);
        self.console
            .write()
            .log_plugin_unloaded(&self.plugin_id, self.context, self.window.id());

        outcome.map_err(|source| {
            log::warn!(
                "Plugin '{}' ({}, {}) failed to tear down: {:#}",
                self.plugin_id,
                self.context,
                self.window.id(),
                source
            );
            LifecycleError::Teardown {
                plugin_id: self.plugin_id.clone(),
                source,
            }
        })
    }

    async fn reconfigure(&mut self, config: Value) -> Result<Transition, LifecycleError> {
        let call = {
            let Some(handle) = self.active.as_ref() else {
                return Ok(Transition::Skipped);
            };
            let Some(hook) = handle.reconfigure.as_ref() else {
                return Ok(Transition::Reconfigured);
            };
            hook(config)
        };

        self.set_state(InstanceState::Reconfiguring);
        let outcome = flatten(tokio::spawn(call).await);
        self.set_state(InstanceState::Active);

        outcome.map(|()| Transition::Reconfigured).map_err(|source| {
            log::warn!("Plugin '{}' rejected new config: {:#}", self.plugin_id, source);
            LifecycleError::Reconfigure {
                plugin_id: self.plugin_id.clone(),
                source,
            }
        })
    }

    async fn content_ready(&mut self) -> Result<Transition, LifecycleError> {
        let call = match self.active.as_ref().and_then(|h| h.content_ready.as_ref()) {
            Some(hook) => hook(()),
            None => return Ok(Transition::Skipped),
        };
        flatten(tokio::spawn(call).await)
            .map(|()| Transition::Settled)
            .map_err(|source| LifecycleError::Activation {
                plugin_id: self.plugin_id.clone(),
                source,
            })
    }
}

/// A transition that has been queued but may not have run yet.
pub struct PendingTransition {
    plugin_id: String,
    window: WindowId,
    inner: PendingInner,
}

enum PendingInner {
    Done(Result<Transition, LifecycleError>),
    Waiting(oneshot::Receiver<Result<Transition, LifecycleError>>),
}

impl PendingTransition {
    fn done(plugin_id: &str, window: WindowId, result: Result<Transition, LifecycleError>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            window,
            inner: PendingInner::Done(result),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    pub async fn wait(self) -> Result<Transition, LifecycleError> {
        match self.inner {
            PendingInner::Done(result) => result,
            PendingInner::Waiting(rx) => rx
                .await
                .unwrap_or(Err(LifecycleError::WorkerClosed(self.plugin_id))),
        }
    }
}

/// Owns the active set of one context.
pub struct LifecycleController {
    context: ContextKind,
    catalog: Arc<PluginCatalog>,
    config: Arc<dyn ConfigSource>,
    console: SharedConsole,
    runtime: Handle,
    windows: RwLock<BTreeMap<WindowId, Arc<dyn HostWindow>>>,
    slots: Mutex<HashMap<SlotKey, SlotHandle>>,
}

impl LifecycleController {
    /// # Panics
    ///
    /// Must be created from within a tokio runtime; slot workers are
    /// spawned onto it.
    pub fn new(
        context: ContextKind,
        catalog: Arc<PluginCatalog>,
        config: Arc<dyn ConfigSource>,
        console: SharedConsole,
    ) -> Self {
        Self {
            context,
            catalog,
            config,
            console,
            runtime: Handle::current(),
            windows: RwLock::new(BTreeMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> ContextKind {
        self.context
    }

    pub fn catalog(&self) -> &Arc<PluginCatalog> {
        &self.catalog
    }

    pub fn attach_window(&self, window: Arc<dyn HostWindow>) {
        self.windows.write().insert(window.id(), window);
    }

    pub fn windows(&self) -> Vec<WindowId> {
        self.windows.read().keys().copied().collect()
    }

    /// Unload everything bound to `window` and forget it.
    ///
    /// The window is forgotten before the unloads run, so commands arriving
    /// meanwhile fail with [`LifecycleError::UnknownWindow`].
    pub async fn detach_window(&self, window: WindowId) -> Vec<(String, Result<Transition, LifecycleError>)> {
        let detached: Vec<(SlotKey, SlotHandle)> = {
            let mut slots = self.slots.lock();
            self.windows.write().remove(&window);
            let keys: Vec<SlotKey> = slots.keys().filter(|key| key.window == window).cloned().collect();
            keys.into_iter()
                .filter_map(|key| slots.remove(&key).map(|slot| (key, slot)))
                .collect()
        };

        let pending: Vec<_> = detached
            .iter()
            .map(|(key, slot)| {
                send(slot, &key.plugin_id, window, |reply| SlotCommand::Unload { reply })
            })
            .collect();
        wait_all(pending).await
    }

    pub fn state(&self, plugin_id: &str, window: WindowId) -> InstanceState {
        let key = SlotKey {
            plugin_id: plugin_id.to_string(),
            window,
        };
        self.slots
            .lock()
            .get(&key)
            .map(|slot| *slot.state.read())
            .unwrap_or(InstanceState::Unloaded)
    }

    /// Plugins currently `Active` (or being reconfigured) in `window`.
    pub fn active_plugins(&self, window: WindowId) -> Vec<String> {
        let slots = self.slots.lock();
        let mut active: Vec<String> = slots
            .iter()
            .filter(|(key, slot)| {
                key.window == window
                    && matches!(
                        *slot.state.read(),
                        InstanceState::Active | InstanceState::Reconfiguring
                    )
            })
            .map(|(key, _)| key.plugin_id.clone())
            .collect();
        active.sort();
        active
    }

    pub fn enqueue_load(&self, plugin_id: &str, window: WindowId) -> PendingTransition {
        self.enqueue(plugin_id, window, |reply| SlotCommand::Load { force: false, reply })
    }

    pub fn enqueue_force_load(&self, plugin_id: &str, window: WindowId) -> PendingTransition {
        self.enqueue(plugin_id, window, |reply| SlotCommand::Load { force: true, reply })
    }

    pub fn enqueue_unload(&self, plugin_id: &str, window: WindowId) -> PendingTransition {
        self.enqueue(plugin_id, window, |reply| SlotCommand::Unload { reply })
    }

    pub fn enqueue_reconfigure(
        &self,
        plugin_id: &str,
        window: WindowId,
        config: Value,
    ) -> PendingTransition {
        self.enqueue(plugin_id, window, |reply| SlotCommand::Reconfigure { config, reply })
    }

    /// Activate `plugin_id` in `window`. Fails if it is already active.
    pub async fn load(&self, plugin_id: &str, window: WindowId) -> Result<Transition, LifecycleError> {
        self.enqueue_load(plugin_id, window).wait().await
    }

    /// Activate, restarting the instance if it is already active.
    pub async fn force_load(&self, plugin_id: &str, window: WindowId) -> Result<Transition, LifecycleError> {
        self.enqueue_force_load(plugin_id, window).wait().await
    }

    /// Tear down the instance. A no-op when nothing is loaded.
    pub async fn unload(&self, plugin_id: &str, window: WindowId) -> Result<Transition, LifecycleError> {
        self.enqueue_unload(plugin_id, window).wait().await
    }

    /// Unload is already unconditional; kept alongside
    /// [`force_load`](Self::force_load) for config-driven resets.
    pub async fn force_unload(&self, plugin_id: &str, window: WindowId) -> Result<Transition, LifecycleError> {
        self.enqueue_force_unload(plugin_id, window).wait().await
    }

    pub fn enqueue_force_unload(&self, plugin_id: &str, window: WindowId) -> PendingTransition {
        self.enqueue_unload(plugin_id, window)
    }

    /// Deliver `config` to every active instance of `plugin_id` in this
    /// context. Instances are never recreated.
    pub async fn reconfigure(
        &self,
        plugin_id: &str,
        config: Value,
    ) -> Vec<(WindowId, Result<Transition, LifecycleError>)> {
        let pending: Vec<_> = self
            .windows()
            .into_iter()
            .filter(|window| self.state(plugin_id, *window) != InstanceState::Unloaded)
            .map(|window| self.enqueue_reconfigure(plugin_id, window, config.clone()))
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for p in pending {
            let window = p.window();
            results.push((window, p.wait().await));
        }
        results
    }

    /// Tell every active frontend instance in `window` its content is ready.
    pub async fn content_ready(&self, window: WindowId) -> Vec<(String, Result<Transition, LifecycleError>)> {
        let pending: Vec<_> = self
            .active_plugins(window)
            .iter()
            .map(|id| self.content_ready_for(id, window))
            .collect();
        wait_all(pending).await
    }

    pub fn content_ready_for(&self, plugin_id: &str, window: WindowId) -> PendingTransition {
        self.enqueue(plugin_id, window, |reply| SlotCommand::ContentReady { reply })
    }

    /// Wait until every command queued so far on the slot has completed.
    pub async fn settled(&self, plugin_id: &str, window: WindowId) {
        let _ = self
            .enqueue(plugin_id, window, |reply| SlotCommand::Barrier { reply })
            .wait()
            .await;
    }

    /// Load every plugin whose merged config is enabled, in catalog order.
    pub async fn load_enabled(&self, window: WindowId) -> Vec<(String, Result<Transition, LifecycleError>)> {
        let mut pending = Vec::new();
        for definition in self.catalog.iter() {
            if definition.unit(self.context).is_none() {
                continue;
            }
            match self.config.get_config(definition.id()).await {
                Ok(config) if config_enabled(&config) => {
                    pending.push(self.enqueue_load(definition.id(), window));
                }
                Ok(_) => {
                    log::debug!("Plugin '{}' is disabled, skipping", definition.id());
                }
                Err(e) => {
                    self.console.write().log_error(&format!(
                        "Could not read config for '{}': {}",
                        definition.id(),
                        e
                    ));
                }
            }
        }

        let results = wait_all(pending).await;
        for (id, result) in &results {
            if let Err(e) = result {
                log::error!("Startup load of '{}' failed: {}", id, e);
            }
        }
        results
    }

    /// Unload every instance in every window.
    pub async fn shutdown(&self) {
        for window in self.windows() {
            for (id, result) in self.detach_window(window).await {
                if let Err(e) = result {
                    log::warn!("Error unloading '{}' during shutdown: {}", id, e);
                }
            }
        }
    }

    fn enqueue(
        &self,
        plugin_id: &str,
        window: WindowId,
        command: impl FnOnce(Reply) -> SlotCommand,
    ) -> PendingTransition {
        let slot = match self.slot(plugin_id, window) {
            Ok(Some(slot)) => slot,
            Ok(None) => return PendingTransition::done(plugin_id, window, Ok(Transition::NoUnit)),
            Err(e) => return PendingTransition::done(plugin_id, window, Err(e)),
        };

        send(&slot, plugin_id, window, command)
    }

    /// Slot for (plugin, window), spawning its worker on first use.
    /// `Ok(None)` when the plugin has no unit in this context.
    fn slot(&self, plugin_id: &str, window: WindowId) -> Result<Option<SlotHandle>, LifecycleError> {
        let definition = self
            .catalog
            .get(plugin_id)
            .ok_or_else(|| LifecycleError::UnknownPlugin(plugin_id.to_string()))?;
        if definition.unit(self.context).is_none() {
            return Ok(None);
        }
        // Slots before windows, matching detach_window.
        let mut slots = self.slots.lock();
        let host_window = self
            .windows
            .read()
            .get(&window)
            .cloned()
            .ok_or(LifecycleError::UnknownWindow(window))?;

        let key = SlotKey {
            plugin_id: plugin_id.to_string(),
            window,
        };
        if let Some(slot) = slots.get(&key) {
            return Ok(Some(slot.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(InstanceState::Unloaded));
        let worker = SlotWorker {
            plugin_id: plugin_id.to_string(),
            context: self.context,
            definition,
            window: host_window,
            config: self.config.clone(),
            console: self.console.clone(),
            state: state.clone(),
            active: None,
        };
        self.runtime.spawn(worker.run(rx));

        let slot = SlotHandle { tx, state };
        slots.insert(key, slot.clone());
        Ok(Some(slot))
    }
}

fn send(
    slot: &SlotHandle,
    plugin_id: &str,
    window: WindowId,
    command: impl FnOnce(Reply) -> SlotCommand,
) -> PendingTransition {
    let (reply, rx) = oneshot::channel();
    if slot.tx.send(command(reply)).is_err() {
        return PendingTransition::done(
            plugin_id,
            window,
            Err(LifecycleError::WorkerClosed(plugin_id.to_string())),
        );
    }
    PendingTransition {
        plugin_id: plugin_id.to_string(),
        window,
        inner: PendingInner::Waiting(rx),
    }
}

async fn wait_all(pending: Vec<PendingTransition>) -> Vec<(String, Result<Transition, LifecycleError>)> {
    let ids: Vec<String> = pending.iter().map(|p| p.plugin_id().to_string()).collect();
    let results = futures::future::join_all(pending.into_iter().map(PendingTransition::wait)).await;
    ids.into_iter().zip(results).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PluginDefinition;
    use crate::channel::ConfigService;
    use crate::config::{ConfigStore, MemoryBackend};
    use crate::console::ConsoleLog;
    use crate::plugin_api::HeadlessWindow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    type Events = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        tag: &'static str,
        events: Events,
    }

    #[async_trait]
    impl PluginHooks for Recorder {
        async fn start(&mut self, ctx: PluginContext, config: Value) -> anyhow::Result<()> {
            self.events.lock().push(format!(
                "{}:start:{}:{}",
                self.tag,
                ctx.window().id().0,
                config["enabled"]
            ));
            Ok(())
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            self.events.lock().push(format!("{}:stop", self.tag));
            Ok(())
        }

        async fn on_config_change(&mut self, config: Value) -> anyhow::Result<()> {
            self.events.lock().push(format!("{}:config:{}", self.tag, config["level"]));
            Ok(())
        }
    }

    struct Fixture {
        controller: LifecycleController,
        store: Arc<ConfigStore>,
        events: Events,
        gate: Arc<Notify>,
    }

    fn fixture() -> Fixture {
        let events: Events = Arc::default();
        let gate = Arc::new(Notify::new());

        let hooks_events = events.clone();
        let fn_events = events.clone();
        let broken_events = events.clone();
        let gated_events = events.clone();
        let gated = gate.clone();

        let catalog = PluginCatalog::new(vec![
            PluginDefinition::builder("hooks", "Hooks")
                .default_config(json!({ "level": 1 }))
                .backend(PluginUnit::hooks(move || Recorder {
                    tag: "hooks",
                    events: hooks_events.clone(),
                }))
                .build()
                .unwrap(),
            PluginDefinition::builder("plain", "Plain")
                .backend(PluginUnit::function(move |_ctx, _config| {
                    let events = fn_events.clone();
                    async move {
                        events.lock().push("plain:start".to_string());
                        let cleanup = events.clone();
                        Ok(Some(Box::new(move || {
                            cleanup.lock().push("plain:stop".to_string());
                            Ok(())
                        }) as crate::plugin_api::Teardown))
                    }
                }))
                .build()
                .unwrap(),
            PluginDefinition::builder("broken", "Broken")
                .backend(PluginUnit::function(move |_ctx, _config| {
                    let events = broken_events.clone();
                    async move {
                        events.lock().push("broken:start".to_string());
                        Err(anyhow::anyhow!("listener port in use"))
                    }
                }))
                .build()
                .unwrap(),
            PluginDefinition::builder("panicky", "Panicky")
                .backend(PluginUnit::function(|_ctx, _config| async move {
                    if true {
                        panic!("setup exploded");
                    }
                    Ok(None)
                }))
                .build()
                .unwrap(),
            PluginDefinition::builder("gated", "Gated")
                .backend(PluginUnit::function(move |_ctx, _config| {
                    let events = gated_events.clone();
                    let gate = gated.clone();
                    async move {
                        gate.notified().await;
                        events.lock().push("gated:start".to_string());
                        let cleanup = events.clone();
                        Ok(Some(Box::new(move || {
                            cleanup.lock().push("gated:stop".to_string());
                            Ok(())
                        }) as crate::plugin_api::Teardown))
                    }
                }))
                .build()
                .unwrap(),
            PluginDefinition::builder("frontend-only", "Frontend only")
                .frontend(PluginUnit::function(|_ctx, _config| async move { Ok(None) }))
                .build()
                .unwrap(),
        ])
        .unwrap();
        let catalog = Arc::new(catalog);

        let store = Arc::new(ConfigStore::open(MemoryBackend::new(), json!({})));
        let service = Arc::new(ConfigService::new(store.clone(), catalog.clone()));
        let controller = LifecycleController::new(
            ContextKind::Backend,
            catalog,
            service,
            Arc::new(RwLock::new(ConsoleLog::new())),
        );
        controller.attach_window(HeadlessWindow::new(WindowId(1)));

        Fixture {
            controller,
            store,
            events,
            gate,
        }
    }

    const W1: WindowId = WindowId(1);

    #[tokio::test]
    async fn load_then_unload_walks_the_states() {
        let f = fixture();
        assert_eq!(f.controller.state("hooks", W1), InstanceState::Unloaded);

        assert_eq!(f.controller.load("hooks", W1).await.unwrap(), Transition::Loaded);
        assert_eq!(f.controller.state("hooks", W1), InstanceState::Active);
        assert_eq!(f.controller.active_plugins(W1), vec!["hooks"]);

        assert_eq!(f.controller.unload("hooks", W1).await.unwrap(), Transition::Unloaded);
        assert_eq!(f.controller.state("hooks", W1), InstanceState::Unloaded);
        assert_eq!(
            f.controller.unload("hooks", W1).await.unwrap(),
            Transition::AlreadyUnloaded
        );

        assert_eq!(*f.events.lock(), vec!["hooks:start:1:false", "hooks:stop"]);
    }

    #[tokio::test]
    async fn setup_sees_merged_config() {
        let f = fixture();
        f.store.set_partial("plugins.hooks", json!({ "enabled": true })).unwrap();
        f.controller.load("hooks", W1).await.unwrap();
        assert_eq!(*f.events.lock(), vec!["hooks:start:1:true"]);
    }

    #[tokio::test]
    async fn second_load_is_rejected_but_force_load_restarts() {
        let f = fixture();
        f.controller.load("plain", W1).await.unwrap();

        let err = f.controller.load("plain", W1).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyActive { .. }));

        assert_eq!(f.controller.force_load("plain", W1).await.unwrap(), Transition::Reloaded);
        assert_eq!(
            *f.events.lock(),
            vec!["plain:start", "plain:stop", "plain:start"]
        );
    }

    #[tokio::test]
    async fn failed_setup_leaves_slot_unloaded() {
        let f = fixture();
        let err = f.controller.load("broken", W1).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Activation { .. }));
        assert!(err.to_string().contains("listener port in use"));
        assert_eq!(f.controller.state("broken", W1), InstanceState::Unloaded);
        assert!(f.controller.active_plugins(W1).is_empty());

        let err = f.controller.load("panicky", W1).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Activation { .. }));
        assert_eq!(f.controller.state("panicky", W1), InstanceState::Unloaded);
    }

    #[tokio::test]
    async fn unknown_plugin_and_window_are_errors() {
        let f = fixture();
        assert!(matches!(
            f.controller.load("ghost", W1).await,
            Err(LifecycleError::UnknownPlugin(_))
        ));
        assert!(matches!(
            f.controller.load("hooks", WindowId(9)).await,
            Err(LifecycleError::UnknownWindow(WindowId(9)))
        ));
    }

    #[tokio::test]
    async fn plugin_without_unit_in_context_is_not_loaded() {
        let f = fixture();
        assert_eq!(
            f.controller.load("frontend-only", W1).await.unwrap(),
            Transition::NoUnit
        );
        assert_eq!(f.controller.state("frontend-only", W1), InstanceState::Unloaded);
    }

    #[tokio::test]
    async fn unload_queued_behind_in_flight_load() {
        let f = fixture();
        let load = f.controller.enqueue_load("gated", W1);
        let unload = f.controller.enqueue_unload("gated", W1);

        f.gate.notify_one();
        assert_eq!(load.wait().await.unwrap(), Transition::Loaded);
        assert_eq!(unload.wait().await.unwrap(), Transition::Unloaded);
        assert_eq!(*f.events.lock(), vec!["gated:start", "gated:stop"]);
    }

    #[tokio::test]
    async fn hung_setup_blocks_only_its_own_slot() {
        let f = fixture();
        let _stuck = f.controller.enqueue_load("gated", W1);

        let other = tokio::time::timeout(Duration::from_secs(5), f.controller.load("plain", W1)).await;
        assert_eq!(other.unwrap().unwrap(), Transition::Loaded);
    }

    #[tokio::test]
    async fn reconfigure_reaches_hooks_without_recreating() {
        let f = fixture();
        f.controller.load("hooks", W1).await.unwrap();
        f.controller.load("plain", W1).await.unwrap();

        let results = f.controller.reconfigure("hooks", json!({ "level": 5 })).await;
        assert!(matches!(results[..], [(W1, Ok(Transition::Reconfigured))]));

        // Function-style units have no hook: nothing to deliver.
        let results = f.controller.reconfigure("plain", json!({})).await;
        assert!(matches!(results[..], [(W1, Ok(Transition::Reconfigured))]));

        assert_eq!(
            *f.events.lock(),
            vec!["hooks:start:1:false", "plain:start", "hooks:config:5"]
        );
        assert_eq!(f.controller.state("hooks", W1), InstanceState::Active);
    }

    #[tokio::test]
    async fn detach_window_unloads_its_instances() {
        let f = fixture();
        f.controller.load("hooks", W1).await.unwrap();
        f.controller.load("plain", W1).await.unwrap();

        let results = f.controller.detach_window(W1).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(Transition::Unloaded))));
        assert!(f.controller.windows().is_empty());
        assert!(f.controller.active_plugins(W1).is_empty());
    }

    #[tokio::test]
    async fn commands_racing_a_detach_cannot_revive_the_window() {
        let f = fixture();
        f.controller.load("hooks", W1).await.unwrap();

        let detach = f.controller.detach_window(W1);
        tokio::pin!(detach);
        // First poll forgets the window and queues the unloads.
        let _ = futures::poll!(&mut detach);

        let late = f.controller.force_load("hooks", W1).await;
        assert!(matches!(late, Err(LifecycleError::UnknownWindow(w)) if w == W1));

        let results = detach.await;
        assert!(matches!(results.as_slice(), [(_, Ok(Transition::Unloaded))]));
        assert_eq!(f.controller.state("hooks", W1), InstanceState::Unloaded);
        assert!(f.controller.active_plugins(W1).is_empty());
        assert_eq!(*f.events.lock(), vec!["hooks:start:1:false", "hooks:stop"]);
    }

    #[tokio::test]
    async fn load_enabled_only_picks_enabled_plugins() {
        let f = fixture();
        f.store.set("plugins.plain.enabled", json!(true)).unwrap();
        f.store.set("plugins.frontend-only.enabled", json!(true)).unwrap();

        let results = f.controller.load_enabled(W1).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "plain");
        assert_eq!(f.controller.active_plugins(W1), vec!["plain"]);
    }
}
