//! Configuration access exposed to plugins

use crate::error::{PluginError, PluginResult};
use crate::permission::{Permission, PermissionSet};
use crate::services::ConfigStore;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct ConfigApi {
    plugin_id: String,
    permissions: PermissionSet,
    store: Arc<dyn ConfigStore>,
}

impl ConfigApi {
    pub(crate) fn new(plugin_id: &str, permissions: PermissionSet, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            permissions,
            store,
        }
    }

    pub fn get(&self, key: &str) -> PluginResult<Option<Value>> {
        self.permissions.require(&self.plugin_id, Permission::ConfigRead)?;
        self.store.get(key).map_err(failed)
    }

    /// Value for `key`, or `default` when unset
    pub fn get_or(&self, key: &str, default: Value) -> PluginResult<Value> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn set(&self, key: &str, value: Value) -> PluginResult<()> {
        self.permissions.require(&self.plugin_id, Permission::ConfigWrite)?;
        self.store.set(key, value).map_err(failed)
    }

    pub fn delete(&self, key: &str) -> PluginResult<()> {
        self.permissions.require(&self.plugin_id, Permission::ConfigWrite)?;
        self.store.delete(key).map_err(failed)
    }
}

fn failed(e: anyhow::Error) -> PluginError {
    PluginError::service("Config", format!("{e:#}"))
}
