use serde_json::{Map, Value};
use std::fmt;

use super::ConfigError;

/// A validated dotted path such as `plugins.shortcuts.enabled`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigPath {
    segments: Vec<String>,
}

impl ConfigPath {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.is_empty() {
            return Err(ConfigError::InvalidPath {
                path: raw.to_string(),
                reason: "path is empty".to_string(),
            });
        }

        let mut segments = Vec::new();
        for segment in raw.split('.') {
            if segment.is_empty() {
                return Err(ConfigError::InvalidPath {
                    path: raw.to_string(),
                    reason: "empty segment".to_string(),
                });
            }
            if !segment.chars().all(is_segment_char) {
                return Err(ConfigError::InvalidPath {
                    path: raw.to_string(),
                    reason: format!("segment '{}' contains an illegal character", segment),
                });
            }
            segments.push(segment.to_string());
        }

        Ok(Self { segments })
    }

    /// Path of a plugin's subtree: `plugins.<id>`.
    pub fn plugin(id: &str) -> Result<Self, ConfigError> {
        Self::parse(&format!("plugins.{}", id))
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True when one path is the other or lies beneath it.
    pub fn overlaps(&self, other: &ConfigPath) -> bool {
        self.segments
            .iter()
            .zip(&other.segments)
            .all(|(a, b)| a == b)
    }

    pub fn first(&self) -> &str {
        &self.segments[0]
    }

    /// Read the value at this path, if every segment resolves.
    pub fn lookup<'a>(&self, tree: &'a Value) -> Option<&'a Value> {
        let mut current = tree;
        for segment in &self.segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Place `value` at this path, creating intermediate objects.
    ///
    /// Fails without touching `tree` when an intermediate segment holds a
    /// non-object value.
    pub fn assign(&self, tree: &mut Value, value: Value) -> Result<(), ConfigError> {
        let slot = self.slot_mut(tree)?;
        *slot = value;
        Ok(())
    }

    /// Mutable access to the slot at this path, creating it as an empty
    /// object when absent.
    pub fn slot_mut<'a>(&self, tree: &'a mut Value) -> Result<&'a mut Value, ConfigError> {
        // Check first so a failing write leaves the tree untouched.
        self.check_descent(tree)?;

        let mut current = tree;
        for segment in &self.segments {
            let Value::Object(map) = current else {
                unreachable!("descent checked before mutation");
            };
            current = map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        Ok(current)
    }

    fn check_descent(&self, tree: &Value) -> Result<(), ConfigError> {
        if !tree.is_object() {
            return Err(ConfigError::Validation {
                path: self.to_string(),
                reason: "configuration root is not a table".to_string(),
            });
        }

        let mut current = tree;
        for (depth, segment) in self.segments.iter().enumerate() {
            let Some(next) = current.as_object().and_then(|map| map.get(segment)) else {
                return Ok(());
            };
            let is_last = depth + 1 == self.segments.len();
            if !is_last && !next.is_object() {
                return Err(ConfigError::Validation {
                    path: self.to_string(),
                    reason: format!(
                        "'{}' holds a non-table value",
                        self.segments[..=depth].join(".")
                    ),
                });
            }
            current = next;
        }
        Ok(())
    }
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}
