use serde_json::{Map, Value};

/// Deep merge `overlay` onto `base`.
///
/// Objects merge key by key, recursively. Any other value in `overlay`
/// (scalars and arrays included) replaces the value in `base` wholesale.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    let mut merged = base.clone();
    merge_into(&mut merged, overlay);
    merged
}

/// In-place variant of [`deep_merge`].
pub fn merge_into(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => merge_maps(target, overlay),
        (target, overlay) => *target = overlay.clone(),
    }
}

fn merge_maps(target: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match target.get_mut(key) {
            Some(existing) => merge_into(existing, value),
            None => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Structural equality. Map comparison is by key, never by insertion order.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(key, value)| b.get(key).is_some_and(|other| deep_equal(value, other)))
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| deep_equal(x, y))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_wins_key_by_key() {
        let defaults = json!({ "enabled": false, "hotkeys": { "play": "F1", "next": "F2" } });
        let persisted = json!({ "enabled": true, "hotkeys": { "next": "F3" } });

        let merged = deep_merge(&defaults, &persisted);
        assert_eq!(
            merged,
            json!({ "enabled": true, "hotkeys": { "play": "F1", "next": "F3" } })
        );
    }

    #[test]
    fn arrays_are_replaced_not_concatenated() {
        let merged = deep_merge(&json!({ "list": [1, 2] }), &json!({ "list": [3] }));
        assert_eq!(merged, json!({ "list": [3] }));
    }

    #[test]
    fn merging_a_value_onto_itself_is_stable() {
        let v = json!({ "a": { "b": [1, { "c": true }] }, "d": "x" });
        assert!(deep_equal(&deep_merge(&v, &v), &v));
    }

    #[test]
    fn equality_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":{"p":true,"q":"s"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":{"q":"s","p":true},"x":1}"#).unwrap();
        assert!(deep_equal(&a, &b));
        assert!(!deep_equal(&a, &json!({ "x": 1 })));
    }
}
