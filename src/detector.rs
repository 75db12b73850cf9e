use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::catalog::{config_enabled, PluginCatalog};
use crate::merge::{deep_equal, deep_merge};

/// Which part of a plugin's config moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangedField {
    /// The `enabled` flag flipped. Other fields may have moved too.
    Enabled,
    /// Something other than `enabled` changed.
    Settings,
}

/// One plugin whose merged config differs between two snapshots.
/// `old_value` and `new_value` are the full merged configs.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub plugin_id: String,
    pub field: ChangedField,
    pub old_value: Value,
    pub new_value: Value,
}

impl ChangeRecord {
    pub fn was_enabled(&self) -> bool {
        config_enabled(&self.old_value)
    }

    pub fn is_enabled(&self) -> bool {
        config_enabled(&self.new_value)
    }
}

pub struct ChangeDetector {
    catalog: Arc<PluginCatalog>,
}

impl ChangeDetector {
    pub fn new(catalog: Arc<PluginCatalog>) -> Self {
        Self { catalog }
    }

    /// Compare two whole-document snapshots.
    pub fn diff_snapshots(&self, old: &Value, new: &Value) -> Vec<ChangeRecord> {
        let empty = Value::Object(Map::new());
        self.diff(
            old.get("plugins").unwrap_or(&empty),
            new.get("plugins").unwrap_or(&empty),
        )
    }

    /// Compare two `plugins` subtrees.
    ///
    /// Ids are visited in new-subtree order, followed by ids that only the
    /// old subtree still has (their override was dropped, so they fall back
    /// to defaults). Ids unknown to the catalog are skipped.
    pub fn diff(&self, old_plugins: &Value, new_plugins: &Value) -> Vec<ChangeRecord> {
        let mut ids: Vec<&String> = keys(new_plugins).collect();
        ids.extend(keys(old_plugins).filter(|id| new_plugins.get(id.as_str()).is_none()));

        let mut records = Vec::new();
        for id in ids {
            let Some(definition) = self.catalog.get(id) else {
                log::debug!("Ignoring config for unknown plugin '{}'", id);
                continue;
            };

            let merged = |subtree: &Value| match subtree.get(id.as_str()) {
                Some(stored) => deep_merge(definition.default_config(), stored),
                None => definition.default_config().clone(),
            };
            let old_value = merged(old_plugins);
            let new_value = merged(new_plugins);
            if deep_equal(&old_value, &new_value) {
                continue;
            }

            let field = if config_enabled(&old_value) != config_enabled(&new_value) {
                ChangedField::Enabled
            } else {
                ChangedField::Settings
            };
            records.push(ChangeRecord {
                plugin_id: id.clone(),
                field,
                old_value,
                new_value,
            });
        }
        records
    }
}

fn keys(subtree: &Value) -> impl Iterator<Item = &String> {
    subtree.as_object().into_iter().flat_map(|map| map.keys())
}
