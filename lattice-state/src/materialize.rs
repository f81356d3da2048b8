//! Value Materialization
//!
//! Turns the full value a derived variable computed into what one handle of
//! it observes, by following the handle's nested path.

use serde_json::{Map, Value};

/// Follow `path` into `value`.
///
/// Object segments are keys, array segments are indices. A path that does
/// not exist yet yields `null`: the server simply has not populated it.
pub fn extract_nested(value: &Value, path: &[String]) -> Value {
    let mut current = value;
    for segment in path {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|idx| items.get(idx)),
            _ => None,
        };
        match next {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Write `value` at `path` inside `target`, creating objects on the way.
///
/// Array segments must address an existing element; otherwise `target` is
/// left untouched.
pub fn insert_nested(target: &mut Value, path: &[String], value: Value) {
    let Some((segment, rest)) = path.split_first() else {
        *target = value;
        return;
    };
    if let Value::Array(items) = target {
        if let Some(item) = segment.parse::<usize>().ok().and_then(|idx| items.get_mut(idx)) {
            insert_nested(item, rest, value);
        }
        return;
    }
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        let slot = map.entry(segment.clone()).or_insert(Value::Null);
        insert_nested(slot, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_path_returns_whole_value() {
        let value = json!({"a": 1});
        assert_eq!(extract_nested(&value, &[]), value);
    }

    #[test]
    fn walks_objects_and_arrays() {
        let value = json!({"rows": [{"name": "x"}, {"name": "y"}]});
        assert_eq!(extract_nested(&value, &path(&["rows", "1", "name"])), json!("y"));
    }

    #[test]
    fn missing_segments_yield_null() {
        let value = json!({"rows": [1]});
        assert_eq!(extract_nested(&value, &path(&["cols"])), Value::Null);
        assert_eq!(extract_nested(&value, &path(&["rows", "5"])), Value::Null);
        assert_eq!(extract_nested(&value, &path(&["rows", "0", "deep"])), Value::Null);
    }

    #[test]
    fn insert_creates_intermediate_objects() {
        let mut target = json!({"a": {"keep": true}});
        insert_nested(&mut target, &path(&["a", "b", "c"]), json!(3));
        assert_eq!(target, json!({"a": {"keep": true, "b": {"c": 3}}}));
    }

    #[test]
    fn insert_into_arrays_needs_an_existing_index() {
        let mut target = json!({"rows": [1, 2]});
        insert_nested(&mut target, &path(&["rows", "1"]), json!(20));
        insert_nested(&mut target, &path(&["rows", "5"]), json!(50));
        assert_eq!(target, json!({"rows": [1, 20]}));
    }
}
