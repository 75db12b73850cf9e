use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ConfigPath;
use crate::merge::deep_merge;
use crate::plugin_api::{ContextKind, PluginInfo, PluginUnit};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("duplicate plugin id: {0}")]
    Duplicate(String),

    #[error("invalid plugin id '{0}'")]
    InvalidId(String),

    #[error("plugin '{id}' has an invalid default config: {reason}")]
    InvalidDefaults { id: String, reason: String },
}

/// Static description of a plugin. Immutable once the catalog is built.
#[derive(Debug)]
pub struct PluginDefinition {
    id: String,
    name: String,
    description: String,
    default_config: Value,
    restart_required: bool,
    backend: Option<PluginUnit>,
    frontend: Option<PluginUnit>,
}

impl PluginDefinition {
    pub fn builder(id: &str, name: &str) -> PluginDefinitionBuilder {
        PluginDefinitionBuilder {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            default_config: json!({ "enabled": false }),
            restart_required: false,
            backend: None,
            frontend: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_config(&self) -> &Value {
        &self.default_config
    }

    pub fn restart_required(&self) -> bool {
        self.restart_required
    }

    pub fn unit(&self, context: ContextKind) -> Option<&PluginUnit> {
        match context {
            ContextKind::Backend => self.backend.as_ref(),
            ContextKind::Frontend => self.frontend.as_ref(),
        }
    }

    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            restart_required: self.restart_required,
        }
    }
}

pub struct PluginDefinitionBuilder {
    id: String,
    name: String,
    description: String,
    default_config: Value,
    restart_required: bool,
    backend: Option<PluginUnit>,
    frontend: Option<PluginUnit>,
}

impl PluginDefinitionBuilder {
    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Default settings. `enabled` defaults to `false` when omitted.
    pub fn default_config(mut self, config: Value) -> Self {
        self.default_config = config;
        self
    }

    pub fn restart_required(mut self, required: bool) -> Self {
        self.restart_required = required;
        self
    }

    pub fn backend(mut self, unit: PluginUnit) -> Self {
        self.backend = Some(unit);
        self
    }

    pub fn frontend(mut self, unit: PluginUnit) -> Self {
        self.frontend = Some(unit);
        self
    }

    pub fn build(self) -> Result<PluginDefinition, CatalogError> {
        let path_ok = !self.id.contains('.') && ConfigPath::plugin(&self.id).is_ok();
        if !path_ok {
            return Err(CatalogError::InvalidId(self.id));
        }

        let Value::Object(mut defaults) = self.default_config else {
            return Err(CatalogError::InvalidDefaults {
                id: self.id,
                reason: "expected a table".to_string(),
            });
        };
        match defaults.get("enabled") {
            None => {
                defaults.insert("enabled".to_string(), Value::Bool(false));
            }
            Some(Value::Bool(_)) => {}
            Some(_) => {
                return Err(CatalogError::InvalidDefaults {
                    id: self.id,
                    reason: "'enabled' must be a boolean".to_string(),
                });
            }
        }

        Ok(PluginDefinition {
            id: self.id,
            name: self.name,
            description: self.description,
            default_config: Value::Object(defaults),
            restart_required: self.restart_required,
            backend: self.backend,
            frontend: self.frontend,
        })
    }
}

/// Registry of every plugin known to the process, fixed at startup.
#[derive(Debug, Default)]
pub struct PluginCatalog {
    order: Vec<String>,
    plugins: HashMap<String, Arc<PluginDefinition>>,
}

impl PluginCatalog {
    pub fn new(definitions: Vec<PluginDefinition>) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();
        for definition in definitions {
            if catalog.plugins.contains_key(definition.id()) {
                return Err(CatalogError::Duplicate(definition.id));
            }
            catalog.order.push(definition.id.clone());
            catalog
                .plugins
                .insert(definition.id.clone(), Arc::new(definition));
        }
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PluginDefinition>> {
        self.plugins.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    /// Plugin ids in registration order.
    pub fn list_ids(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PluginDefinition>> {
        self.order.iter().filter_map(|id| self.plugins.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Defaults of `id` with the override stored in `tree` merged on top.
    pub fn merged_config(&self, id: &str, tree: &Value) -> Option<Value> {
        let definition = self.plugins.get(id)?;
        let stored = plugin_override(tree, id);
        Some(match stored {
            Some(stored) => deep_merge(definition.default_config(), stored),
            None => definition.default_config().clone(),
        })
    }

    pub fn is_enabled(&self, id: &str, tree: &Value) -> bool {
        self.merged_config(id, tree)
            .as_ref()
            .is_some_and(config_enabled)
    }

    /// Merged config for every catalogued plugin.
    pub fn merged_all(&self, tree: &Value) -> Map<String, Value> {
        self.order
            .iter()
            .filter_map(|id| Some((id.clone(), self.merged_config(id, tree)?)))
            .collect()
    }
}

/// The raw `plugins.<id>` override in `tree`.
pub fn plugin_override<'a>(tree: &'a Value, id: &str) -> Option<&'a Value> {
    tree.get("plugins")?.get(id)
}

pub fn config_enabled(config: &Value) -> bool {
    config.get("enabled").and_then(Value::as_bool).unwrap_or(false)
}
