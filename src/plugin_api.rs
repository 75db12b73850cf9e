use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::channel::ConfigSource;

/// Information about a plugin, as shown to settings surfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub restart_required: bool,
}

/// The execution context a unit runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    /// Privileged side: owns the config store and the windows.
    Backend,
    /// Content-rendering side, one per window.
    Frontend,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend => f.write_str("backend"),
            Self::Frontend => f.write_str("frontend"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowId(pub u32);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window#{}", self.0)
    }
}

/// A top-level window as seen by plugins. Construction and rendering are
/// owned by the host.
pub trait HostWindow: Send + Sync {
    fn id(&self) -> WindowId;

    fn title(&self) -> String;

    fn set_title(&self, title: &str);
}

/// Window without any native surface behind it.
pub struct HeadlessWindow {
    id: WindowId,
    title: RwLock<String>,
}

impl HeadlessWindow {
    pub fn new(id: WindowId) -> Arc<Self> {
        Arc::new(Self {
            id,
            title: RwLock::new(String::new()),
        })
    }
}

impl HostWindow for HeadlessWindow {
    fn id(&self) -> WindowId {
        self.id
    }

    fn title(&self) -> String {
        self.title.read().clone()
    }

    fn set_title(&self, title: &str) {
        *self.title.write() = title.to_string();
    }
}

/// Capability handle given to a unit when it is activated.
///
/// Reads may target any path; writes only ever reach the plugin's own
/// subtree.
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: Arc<str>,
    context: ContextKind,
    window: Arc<dyn HostWindow>,
    config: Arc<dyn ConfigSource>,
}

impl PluginContext {
    pub fn new(
        plugin_id: &str,
        context: ContextKind,
        window: Arc<dyn HostWindow>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
            context,
            window,
            config,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn context(&self) -> ContextKind {
        self.context
    }

    pub fn window(&self) -> &Arc<dyn HostWindow> {
        &self.window
    }

    /// This plugin's merged configuration.
    pub async fn config(&self) -> anyhow::Result<Value> {
        Ok(self.config.get_config(&self.plugin_id).await?)
    }

    /// Merge `partial` into this plugin's subtree.
    pub async fn set_config(&self, partial: Value) -> anyhow::Result<()> {
        Ok(self.config.set_config(&self.plugin_id, partial).await?)
    }

    /// Read any value in the tree, e.g. `options.tray`.
    pub async fn read(&self, path: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.config.get_value(path).await?)
    }
}

/// Cleanup returned by a function-style unit.
pub type Teardown = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

pub type ActivateFn =
    dyn Fn(PluginContext, Value) -> BoxFuture<'static, anyhow::Result<Option<Teardown>>> + Send + Sync;

pub type HooksFactory = dyn Fn() -> Box<dyn PluginHooks> + Send + Sync;

/// Object-style unit. Every hook is optional.
///
/// The host calls at most one `start` before a matching `stop`, and never
/// calls `on_config_change` or `on_content_ready` before `start` finished.
#[async_trait]
pub trait PluginHooks: Send {
    async fn start(&mut self, _ctx: PluginContext, _config: Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_config_change(&mut self, _config: Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Frontend only: the window's content finished loading.
    async fn on_content_ready(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Activation logic for one plugin in one context.
#[derive(Clone)]
pub enum PluginUnit {
    Function(Arc<ActivateFn>),
    Hooks(Arc<HooksFactory>),
}

impl PluginUnit {
    pub fn function<F, Fut>(activate: F) -> Self
    where
        F: Fn(PluginContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Teardown>>> + Send + 'static,
    {
        Self::Function(Arc::new(
            move |ctx: PluginContext,
                  config: Value|
                  -> BoxFuture<'static, anyhow::Result<Option<Teardown>>> {
                Box::pin(activate(ctx, config))
            },
        ))
    }

    pub fn hooks<F, H>(factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: PluginHooks + 'static,
    {
        Self::Hooks(Arc::new(move || Box::new(factory()) as Box<dyn PluginHooks>))
    }

    pub fn is_hooks(&self) -> bool {
        matches!(self, Self::Hooks(_))
    }
}

impl fmt::Debug for PluginUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("PluginUnit::Function"),
            Self::Hooks(_) => f.write_str("PluginUnit::Hooks"),
        }
    }
}
