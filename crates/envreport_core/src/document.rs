use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::env::{display_value, lookup_map, lookup_scalar, EnvironmentMap};

/// Normalized, index-ready record built from one environment map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub python_version: Option<String>,
    pub platform: Option<String>,
    pub packages: Vec<String>,
    pub plugins: Vec<String>,
    pub playwright_platform: Option<String>,
}

/// Normalize with a fresh v4 id and the current UTC time.
pub fn normalize(env: &EnvironmentMap) -> ResultDocument {
    normalize_at(env, Uuid::new_v4().to_string(), Utc::now())
}

/// Normalize with a caller-supplied id and capture time.
///
/// Total over every input: missing or mistyped fields degrade to `None` or an
/// empty list.
pub fn normalize_at(
    env: &EnvironmentMap,
    id: impl Into<String>,
    timestamp: DateTime<Utc>,
) -> ResultDocument {
    ResultDocument {
        id: id.into(),
        timestamp,
        python_version: scalar(env, "Python"),
        platform: scalar(env, "Platform"),
        packages: flatten(env, "Packages"),
        plugins: flatten(env, "plugins"),
        playwright_platform: scalar(env, "PLATFORM"),
    }
}

fn scalar(env: &EnvironmentMap, key: &str) -> Option<String> {
    lookup_scalar(env, key)
        .filter(|value| !value.is_null())
        .map(display_value)
}

fn flatten(env: &EnvironmentMap, key: &str) -> Vec<String> {
    lookup_map(env, key)
        .iter()
        .map(|(name, version)| format!("{name}: {}", display_value(version)))
        .collect()
}
