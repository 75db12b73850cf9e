use serde_json::Value;

use super::path::ConfigPath;
use super::ConfigError;

/// Validate `tree` after a write at `path`.
///
/// Only the region touched by the write is checked, so a hand-edited
/// document with stray values elsewhere does not block unrelated writes.
pub fn validate_write(path: &ConfigPath, tree: &Value) -> Result<(), ConfigError> {
    if let Some(written) = path.lookup(tree) {
        check_representable(&path.to_string(), written)?;
    }

    match path.first() {
        "plugins" => check_plugins(tree),
        "options" => expect_table(tree, "options"),
        "window-size" => check_geometry(tree, "window-size", ["width", "height"]),
        "window-position" => check_geometry(tree, "window-position", ["x", "y"]),
        "window-maximized" => match tree.get("window-maximized") {
            None | Some(Value::Bool(_)) => Ok(()),
            Some(_) => Err(invalid("window-maximized", "expected a boolean")),
        },
        _ => Ok(()),
    }
}

/// The persisted document is TOML: no nulls, integers within `i64`.
fn check_representable(at: &str, value: &Value) -> Result<(), ConfigError> {
    match value {
        Value::Null => Err(invalid(at, "null values cannot be stored")),
        Value::Number(n) if n.is_u64() && n.as_i64().is_none() => {
            Err(invalid(at, "integer does not fit in 64-bit signed range"))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| check_representable(&format!("{}[{}]", at, i), item)),
        Value::Object(map) => map
            .iter()
            .try_for_each(|(key, item)| check_representable(&format!("{}.{}", at, key), item)),
        _ => Ok(()),
    }
}

fn check_plugins(tree: &Value) -> Result<(), ConfigError> {
    let Some(plugins) = tree.get("plugins") else {
        return Ok(());
    };
    let Some(plugins) = plugins.as_object() else {
        return Err(invalid("plugins", "expected a table"));
    };

    for (id, subtree) in plugins {
        let at = format!("plugins.{}", id);
        let Some(settings) = subtree.as_object() else {
            return Err(invalid(&at, "expected a table"));
        };
        if let Some(enabled) = settings.get("enabled") {
            if !enabled.is_boolean() {
                return Err(invalid(&format!("{}.enabled", at), "expected a boolean"));
            }
        }
    }
    Ok(())
}

fn expect_table(tree: &Value, key: &str) -> Result<(), ConfigError> {
    match tree.get(key) {
        None | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(invalid(key, "expected a table")),
    }
}

fn check_geometry(tree: &Value, key: &str, fields: [&str; 2]) -> Result<(), ConfigError> {
    let Some(value) = tree.get(key) else {
        return Ok(());
    };
    let Some(map) = value.as_object() else {
        return Err(invalid(key, "expected a table"));
    };
    for field in fields {
        if !map.get(field).is_some_and(Value::is_number) {
            return Err(invalid(key, &format!("'{}' must be a number", field)));
        }
    }
    Ok(())
}

fn invalid(path: &str, reason: &str) -> ConfigError {
    ConfigError::Validation {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
