use serde_json::{Map, Value};

/// Decoded JSON payload describing a captured runtime.
pub type EnvironmentMap = Map<String, Value>;

/// Key under which newer reports nest their fields.
pub const NESTED_KEY: &str = "environment";

/// Resolve `key` from the nested section first, then from the top level.
///
/// The nested section wins only when it is a map that contains `key`.
/// Absence in both places yields `None`.
pub fn lookup_scalar<'a>(env: &'a EnvironmentMap, key: &str) -> Option<&'a Value> {
    if let Some(Value::Object(nested)) = env.get(NESTED_KEY) {
        if let Some(value) = nested.get(key) {
            return Some(value);
        }
    }
    env.get(key)
}

/// Resolve a collection `key` with the same nested-then-flat precedence.
///
/// Only map values qualify; anything else (missing, list, scalar) resolves to
/// an empty map so flattening never fails.
pub fn lookup_map(env: &EnvironmentMap, key: &str) -> EnvironmentMap {
    if let Some(Value::Object(nested)) = env.get(NESTED_KEY) {
        if let Some(Value::Object(map)) = nested.get(key) {
            return map.clone();
        }
    }
    match env.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => EnvironmentMap::new(),
    }
}

/// Display form of a JSON value: strings unquoted, everything else as compact JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
