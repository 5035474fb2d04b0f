//! Per-plugin runtime config (`plugin-config.json`)
//!
//! Reads never fail the caller: unreadable or malformed files fall back to
//! defaults, and legacy (`0.0`) files are migrated forward on read.

use crate::error::{PluginError, PluginResult};
use crate::permission::Permission;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, warn};

/// File name of the runtime config inside a plugin directory
pub const RUNTIME_CONFIG_FILE: &str = "plugin-config.json";

/// Current schema version
pub const CONFIG_VERSION: &str = "1.0";

const LEGACY_VERSION: &str = "0.0";

/// Persisted, mutable per-plugin settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub version: String,
    pub enabled: bool,
    pub granted_permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<Map<String, Value>>,
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            enabled: false,
            granted_permissions: Vec::new(),
            custom_config: None,
            updated_at: None,
        }
    }
}

impl RuntimeConfig {
    pub fn is_granted(&self, permission: Permission) -> bool {
        self.granted_permissions.contains(&permission)
    }

    /// Insert a value into the custom config blob, creating it if absent
    pub fn set_custom(&mut self, key: impl Into<String>, value: Value) {
        self.custom_config
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
    }

    pub fn custom(&self, key: &str) -> Option<&Value> {
        self.custom_config.as_ref().and_then(|c| c.get(key))
    }
}

/// Load the runtime config stored in `plugin_dir`
///
/// A missing file is created with defaults.
pub async fn load(plugin_dir: &Path) -> RuntimeConfig {
    let path = plugin_dir.join(RUNTIME_CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut config = RuntimeConfig::default();
            if let Err(e) = save(plugin_dir, &mut config).await {
                warn!(path = %path.display(), error = %e, "Failed to write default plugin config");
            }
            return config;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read plugin config, using defaults");
            return RuntimeConfig::default();
        }
    };

    match serde_json::from_str::<Value>(&content) {
        Ok(value) => decode(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Plugin config is not valid JSON, using defaults");
            RuntimeConfig::default()
        }
    }
}

/// Write `config` to `plugin_dir`, stamping `updated_at`
pub async fn save(plugin_dir: &Path, config: &mut RuntimeConfig) -> PluginResult<()> {
    let path = plugin_dir.join(RUNTIME_CONFIG_FILE);
    config.updated_at = Some(chrono::Utc::now().timestamp_millis());

    let contents = serde_json::to_string_pretty(config)?;
    tokio::fs::write(&path, contents).await.map_err(|e| {
        PluginError::Config(format!(
            "Failed to save plugin config {}: {e}",
            path.display()
        ))
    })?;

    debug!(path = %path.display(), "Saved plugin config");
    Ok(())
}

/// Interpret a decoded JSON document as a runtime config
pub fn decode(value: Value) -> RuntimeConfig {
    let Value::Object(object) = value else {
        warn!("Plugin config is not an object, using defaults");
        return RuntimeConfig::default();
    };

    match object.get("version") {
        None => migrate_legacy(&object),
        Some(Value::String(v)) if v == LEGACY_VERSION => migrate_legacy(&object),
        Some(Value::String(v)) if v == CONFIG_VERSION => decode_current(&object),
        Some(other) => {
            warn!(version = %other, "Unknown plugin config version, using defaults");
            RuntimeConfig::default()
        }
    }
}

fn decode_current(object: &Map<String, Value>) -> RuntimeConfig {
    let (Some(Value::Bool(enabled)), Some(Value::Array(granted))) =
        (object.get("enabled"), object.get("grantedPermissions"))
    else {
        warn!("Plugin config has an invalid shape, using defaults");
        return RuntimeConfig::default();
    };

    RuntimeConfig {
        version: CONFIG_VERSION.to_string(),
        enabled: *enabled,
        granted_permissions: parse_permissions(granted),
        custom_config: match object.get("customConfig") {
            Some(Value::Object(custom)) => Some(custom.clone()),
            _ => None,
        },
        updated_at: object.get("updatedAt").and_then(Value::as_i64),
    }
}

/// `0.0` files used `permissions` and `settings` and defaulted to enabled
fn migrate_legacy(object: &Map<String, Value>) -> RuntimeConfig {
    let granted = object
        .get("permissions")
        .or_else(|| object.get("grantedPermissions"))
        .and_then(Value::as_array)
        .map(|values| parse_permissions(values))
        .unwrap_or_default();

    let custom = object
        .get("customConfig")
        .or_else(|| object.get("settings"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    debug!("Migrated plugin config from {LEGACY_VERSION} to {CONFIG_VERSION}");

    RuntimeConfig {
        version: CONFIG_VERSION.to_string(),
        enabled: object.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        granted_permissions: granted,
        custom_config: Some(custom),
        updated_at: Some(chrono::Utc::now().timestamp_millis()),
    }
}

fn parse_permissions(values: &[Value]) -> Vec<Permission> {
    values
        .iter()
        .filter_map(|value| {
            let token = value.as_str()?;
            match token.parse::<Permission>() {
                Ok(permission) => Some(permission),
                Err(_) => {
                    warn!(token, "Dropping unknown permission from plugin config");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.version, "1.0");
        assert!(!config.enabled);
        assert!(config.granted_permissions.is_empty());
    }

    #[test]
    fn test_decode_current() {
        let config = decode(json!({
            "version": "1.0",
            "enabled": true,
            "grantedPermissions": ["ui:show", "bogus:token"],
            "customConfig": { "theme": "dark" },
            "updatedAt": 42
        }));
        assert!(config.enabled);
        assert_eq!(config.granted_permissions, vec![Permission::UiShow]);
        assert_eq!(config.custom("theme"), Some(&json!("dark")));
        assert_eq!(config.updated_at, Some(42));
    }

    #[test]
    fn test_invalid_shape_falls_back() {
        assert_eq!(decode(json!({ "version": "1.0", "enabled": "yes" })), RuntimeConfig::default());
        assert_eq!(decode(json!([1, 2, 3])), RuntimeConfig::default());
    }

    #[test]
    fn test_unknown_version_falls_back() {
        let config = decode(json!({ "version": "9.9", "enabled": true, "grantedPermissions": [] }));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_legacy_migration() {
        let config = decode(json!({
            "version": "0.0",
            "permissions": ["files:open"],
            "settings": { "limit": 3 }
        }));
        assert_eq!(config.version, "1.0");
        assert!(config.enabled, "legacy configs default to enabled");
        assert_eq!(config.granted_permissions, vec![Permission::FilesOpen]);
        assert_eq!(config.custom("limit"), Some(&json!(3)));
        assert!(config.updated_at.is_some());
    }

    #[test]
    fn test_versionless_is_legacy() {
        let config = decode(json!({ "enabled": false }));
        assert!(!config.enabled);
        assert_eq!(config.version, "1.0");
    }

    #[tokio::test]
    async fn test_missing_file_is_created() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = load(tmp.path()).await;

        assert_eq!(config.version, "1.0");
        assert!(tmp.path().join(RUNTIME_CONFIG_FILE).exists());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = RuntimeConfig {
            enabled: true,
            granted_permissions: vec![Permission::ConfigRead],
            ..RuntimeConfig::default()
        };
        config.set_custom("gitUrl", json!("https://example.com/p.git"));

        save(tmp.path(), &mut config).await.expect("save");
        assert!(config.updated_at.is_some());

        let loaded = load(tmp.path()).await;
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_garbage_file_falls_back() {
        let tmp = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(tmp.path().join(RUNTIME_CONFIG_FILE), "{not json")
            .await
            .expect("write");
        assert_eq!(load(tmp.path()).await, RuntimeConfig::default());
    }
}
