//! Export and restore options.
//!
//! Options arrive from collaborators as loosely-typed maps. Unknown keys are
//! dropped, known keys are coerced to booleans and missing keys take the
//! defaults below. The resolved structs are frozen into the job record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    #[serde(default = "yes")]
    pub include_database: bool,
    #[serde(default = "yes")]
    pub include_themes: bool,
    #[serde(default = "yes")]
    pub include_plugins: bool,
    #[serde(default = "yes")]
    pub include_uploads: bool,
    #[serde(default = "yes")]
    pub include_mu_plugins: bool,
    #[serde(default = "yes")]
    pub exclude_cache: bool,
    #[serde(default)]
    pub exclude_inactive_themes: bool,
    #[serde(default)]
    pub exclude_inactive_plugins: bool,
    #[serde(default = "yes")]
    pub exclude_spam_comments: bool,
    #[serde(default)]
    pub exclude_post_revisions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    #[serde(default = "yes")]
    pub restore_database: bool,
    #[serde(default = "yes")]
    pub restore_files: bool,
}

fn yes() -> bool {
    true
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_database: true,
            include_themes: true,
            include_plugins: true,
            include_uploads: true,
            include_mu_plugins: true,
            exclude_cache: true,
            exclude_inactive_themes: false,
            exclude_inactive_plugins: false,
            exclude_spam_comments: true,
            exclude_post_revisions: false,
        }
    }
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            restore_database: true,
            restore_files: true,
        }
    }
}

impl ExportOptions {
    /// Resolve options from an untyped map.
    pub fn from_map(raw: &Map<String, Value>) -> Self {
        let mut options = Self::default();
        for (key, value) in raw {
            let Some(flag) = coerce_bool(value) else {
                continue;
            };
            match key.as_str() {
                "include_database" => options.include_database = flag,
                "include_themes" => options.include_themes = flag,
                "include_plugins" => options.include_plugins = flag,
                "include_uploads" => options.include_uploads = flag,
                "include_mu_plugins" => options.include_mu_plugins = flag,
                "exclude_cache" => options.exclude_cache = flag,
                "exclude_inactive_themes" => options.exclude_inactive_themes = flag,
                "exclude_inactive_plugins" => options.exclude_inactive_plugins = flag,
                "exclude_spam_comments" => options.exclude_spam_comments = flag,
                "exclude_post_revisions" => options.exclude_post_revisions = flag,
                _ => tracing::debug!(key = %key, "Dropping unknown export option"),
            }
        }
        options
    }
}

impl RestoreOptions {
    pub fn from_map(raw: &Map<String, Value>) -> Self {
        let mut options = Self::default();
        for (key, value) in raw {
            let Some(flag) = coerce_bool(value) else {
                continue;
            };
            match key.as_str() {
                "restore_database" => options.restore_database = flag,
                "restore_files" => options.restore_files = flag,
                _ => tracing::debug!(key = %key, "Dropping unknown restore option"),
            }
        }
        options
    }
}

/// Parse `key=value` pairs (as given on the command line) into a map.
pub fn parse_pairs<S: AsRef<str>>(pairs: &[S]) -> crate::Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            crate::ArchiverError::Validation(format!("expected key=value, got '{}'", pair))
        })?;
        map.insert(key.trim().to_string(), Value::String(value.trim().to_string()));
    }
    Ok(map)
}

/// Lenient boolean coercion. Returns None for values that carry no truth
/// value (arrays, objects, unrecognised strings), which leaves the default.
fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            _ => None,
        },
        Value::Null => Some(false),
        Value::Array(_) | Value::Object(_) => None,
    }
}
