//! Config read/write channel (`get-config`, `set-config`).
//!
//! The backend owns the store and answers requests through
//! [`ConfigService`]. Other contexts talk to it through a [`ConfigClient`]
//! over an ordered message channel. Both implement [`ConfigSource`], which is
//! what plugin units see.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::catalog::PluginCatalog;
use crate::config::{ConfigError, ConfigPath, ConfigStore};
use crate::plugin_api::PluginInfo;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("peer unreachable: {0}")]
    Delivery(String),

    #[error("peer dropped the request without replying")]
    NoReply,
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Defaults merged with the stored override.
    async fn get_config(&self, id: &str) -> Result<Value, ChannelError>;

    /// Merge `partial` into `plugins.<id>`.
    async fn set_config(&self, id: &str, partial: Value) -> Result<(), ChannelError>;

    async fn get_value(&self, path: &str) -> Result<Option<Value>, ChannelError>;

    async fn plugins(&self) -> Result<Vec<PluginInfo>, ChannelError>;

    /// Catalogued plugin ids in registration order (`get-plugin-ids`).
    async fn plugin_ids(&self) -> Result<Vec<String>, ChannelError>;
}

/// Backend-side answerer, reading straight from the store.
pub struct ConfigService {
    store: Arc<ConfigStore>,
    catalog: Arc<PluginCatalog>,
}

impl ConfigService {
    pub fn new(store: Arc<ConfigStore>, catalog: Arc<PluginCatalog>) -> Self {
        Self { store, catalog }
    }

    pub fn get_config(&self, id: &str) -> Result<Value, ChannelError> {
        self.catalog
            .merged_config(id, &self.store.snapshot())
            .ok_or_else(|| ChannelError::UnknownPlugin(id.to_string()))
    }

    pub fn set_config(&self, id: &str, partial: Value) -> Result<(), ChannelError> {
        if !self.catalog.contains(id) {
            return Err(ChannelError::UnknownPlugin(id.to_string()));
        }
        let path = ConfigPath::plugin(id)?;
        self.store
            .set_partial(&path.to_string(), partial)
            .map_err(|e| {
                log::warn!("Rejected config update for '{}': {}", id, e);
                e.into()
            })
    }

    /// Value at `path`. Paths inside a catalogued plugin's subtree read
    /// from its merged config, so declared defaults show through.
    pub fn get_value(&self, path: &str) -> Result<Option<Value>, ChannelError> {
        let parsed = ConfigPath::parse(path)?;
        if let [root, id, rest @ ..] = parsed.segments() {
            if root == "plugins" {
                if let Some(merged) = self.catalog.merged_config(id, &self.store.snapshot()) {
                    return Ok(rest
                        .iter()
                        .try_fold(&merged, |value, key| value.get(key.as_str()))
                        .cloned());
                }
            }
        }
        Ok(self.store.get(path)?)
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.catalog.iter().map(|definition| definition.info()).collect()
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        self.catalog.list_ids().to_vec()
    }

    /// Answer requests from `rx` until every client is gone.
    pub async fn serve(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ConfigRequest>) {
        while let Some(request) = rx.recv().await {
            self.handle(request);
        }
        log::debug!("Config channel closed");
    }

    /// Start serving on a new channel and return a client for it.
    pub fn client(self: &Arc<Self>) -> ConfigClient {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().serve(rx));
        ConfigClient { tx }
    }

    fn handle(&self, request: ConfigRequest) {
        // A requester that went away no longer cares about the answer.
        match request {
            ConfigRequest::GetConfig { id, reply } => {
                let _ = reply.send(self.get_config(&id));
            }
            ConfigRequest::SetConfig { id, partial, reply } => {
                let _ = reply.send(self.set_config(&id, partial));
            }
            ConfigRequest::GetValue { path, reply } => {
                let _ = reply.send(self.get_value(&path));
            }
            ConfigRequest::Plugins { reply } => {
                let _ = reply.send(Ok(self.plugins()));
            }
            ConfigRequest::PluginIds { reply } => {
                let _ = reply.send(Ok(self.plugin_ids()));
            }
        }
    }
}

#[async_trait]
impl ConfigSource for ConfigService {
    async fn get_config(&self, id: &str) -> Result<Value, ChannelError> {
        ConfigService::get_config(self, id)
    }

    async fn set_config(&self, id: &str, partial: Value) -> Result<(), ChannelError> {
        ConfigService::set_config(self, id, partial)
    }

    async fn get_value(&self, path: &str) -> Result<Option<Value>, ChannelError> {
        ConfigService::get_value(self, path)
    }

    async fn plugins(&self) -> Result<Vec<PluginInfo>, ChannelError> {
        Ok(ConfigService::plugins(self))
    }

    async fn plugin_ids(&self) -> Result<Vec<String>, ChannelError> {
        Ok(ConfigService::plugin_ids(self))
    }
}

type Reply<T> = oneshot::Sender<Result<T, ChannelError>>;

pub enum ConfigRequest {
    GetConfig { id: String, reply: Reply<Value> },
    SetConfig { id: String, partial: Value, reply: Reply<()> },
    GetValue { path: String, reply: Reply<Option<Value>> },
    Plugins { reply: Reply<Vec<PluginInfo>> },
    PluginIds { reply: Reply<Vec<String>> },
}

/// Requester side of the config channel, usable from any context.
#[derive(Clone)]
pub struct ConfigClient {
    tx: mpsc::UnboundedSender<ConfigRequest>,
}

impl ConfigClient {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ConfigRequest,
    ) -> Result<T, ChannelError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| ChannelError::Delivery("config service stopped".to_string()))?;
        response.await.map_err(|_| ChannelError::NoReply)?
    }
}

#[async_trait]
impl ConfigSource for ConfigClient {
    async fn get_config(&self, id: &str) -> Result<Value, ChannelError> {
        let id = id.to_string();
        self.request(|reply| ConfigRequest::GetConfig { id, reply }).await
    }

    async fn set_config(&self, id: &str, partial: Value) -> Result<(), ChannelError> {
        let id = id.to_string();
        self.request(|reply| ConfigRequest::SetConfig { id, partial, reply })
            .await
    }

    async fn get_value(&self, path: &str) -> Result<Option<Value>, ChannelError> {
        let path = path.to_string();
        self.request(|reply| ConfigRequest::GetValue { path, reply }).await
    }

    async fn plugins(&self) -> Result<Vec<PluginInfo>, ChannelError> {
        self.request(|reply| ConfigRequest::Plugins { reply }).await
    }

    async fn plugin_ids(&self) -> Result<Vec<String>, ChannelError> {
        self.request(|reply| ConfigRequest::PluginIds { reply }).await
    }
}
