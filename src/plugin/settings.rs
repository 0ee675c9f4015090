//! Per-plugin configuration: schema defaults merged with the user's
//! plugin config file.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// One typed, keyed option in a plugin's declared config schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOption {
    pub key: String,
    #[serde(default)]
    pub description: String,
    pub default: serde_json::Value,
}

impl ConfigOption {
    pub fn new(key: impl Into<String>, default: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            description: String::new(),
            default,
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Effective settings for one plugin: schema defaults overlaid with the
/// user file. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct PluginSettings {
    values: Arc<HashMap<String, serde_json::Value>>,
}

impl PluginSettings {
    /// Merge schema defaults with user-supplied values (user wins).
    pub fn resolve(
        schema: &[ConfigOption],
        user: HashMap<String, serde_json::Value>,
    ) -> Self {
        let mut values: HashMap<String, serde_json::Value> = schema
            .iter()
            .map(|option| (option.key.clone(), option.default.clone()))
            .collect();
        for (key, value) in user {
            values.insert(key, value);
        }
        Self {
            values: Arc::new(values),
        }
    }

    /// Load the plugin's user config file (`<plugins_dir>/<name>/config.toml`)
    /// and merge over the schema defaults. A missing or unreadable file means
    /// defaults only.
    pub fn load(schema: &[ConfigOption], plugins_dir: &Path, plugin_name: &str) -> Self {
        let path = plugins_dir.join(plugin_name).join("config.toml");
        let user = match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str::<toml::Value>(&text) {
                Ok(value) => flatten_user_values(value),
                Err(error) => {
                    tracing::warn!(
                        plugin = plugin_name,
                        path = %path.display(),
                        %error,
                        "ignoring unparsable plugin config"
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self::resolve(schema, user)
    }

    /// Typed read with a caller-supplied fallback for missing keys or
    /// shape mismatches.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.values.get(key) {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or(default),
            None => default,
        }
    }

    pub fn get_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

fn flatten_user_values(value: toml::Value) -> HashMap<String, serde_json::Value> {
    match value {
        toml::Value::Table(table) => table
            .into_iter()
            .map(|(key, value)| (key, toml_to_json(value)))
            .collect(),
        _ => HashMap::new(),
    }
}

/// Convert a TOML value into its JSON counterpart (datetimes as strings).
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::Value::from(i),
        toml::Value::Float(f) => serde_json::Value::from(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .into_iter()
                .map(|(key, value)| (key, toml_to_json(value)))
                .collect(),
        ),
    }
}
