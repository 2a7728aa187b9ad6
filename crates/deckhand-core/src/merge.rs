//! Canonical-state merge.
//!
//! Channel state is a single JSON object replaced wholesale on every
//! update. `merge_object` builds the replacement: a shallow, right-biased
//! merge where keys present in the partial overwrite (including with
//! `null`) and keys absent from the partial persist from the prior state.

use serde_json::{Map, Value};

pub fn merge_object(canonical: &Value, partial: &Value) -> Value {
    let mut merged: Map<String, Value> = match canonical {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    match partial {
        Value::Object(map) => {
            for (key, value) in map {
                merged.insert(key.clone(), value.clone());
            }
        }
        // A non-object partial cannot be merged key-wise; the incoming
        // value wins outright.
        other => return other.clone(),
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn applied_sequence_equals_left_fold_of_partials() {
        let partials = vec![
            json!({"connected": true, "installed": false}),
            json!({"version": "2.4.1"}),
            json!({"installed": true, "error": null}),
            json!({"connected": false}),
        ];

        let mut canonical = json!({});
        for partial in &partials {
            canonical = merge_object(&canonical, partial);
        }

        assert_eq!(
            canonical,
            json!({
                "connected": false,
                "installed": true,
                "version": "2.4.1",
                "error": null,
            })
        );
    }

    #[test]
    fn keys_absent_from_partial_persist() {
        let canonical = json!({"a": 1, "b": 2});
        let merged = merge_object(&canonical, &json!({"b": 9}));
        assert_eq!(merged, json!({"a": 1, "b": 9}));
    }

    #[test]
    fn null_in_partial_overwrites_prior_value() {
        let canonical = json!({"error": "socket closed"});
        let merged = merge_object(&canonical, &json!({"error": null}));
        assert_eq!(merged, json!({"error": null}));
    }

    #[test]
    fn non_object_canonical_is_replaced_by_object_partial() {
        let merged = merge_object(&Value::Null, &json!({"connected": true}));
        assert_eq!(merged, json!({"connected": true}));
    }
}
