//! Declared and granted permissions, and runtime config persistence
//!
//! The manifest's list is the ceiling. The granted list lives in the
//! runtime config and is what the plugin context actually exposes.

use super::PluginService;
use crate::error::{PluginError, PluginResult};
use crate::events::topics;
use crate::permission::{self, Permission};
use crate::runtime_config::RuntimeConfig;
use serde_json::{Map, Value, json};
use tracing::info;

/// Partial update applied by [`PluginService::save_plugin_runtime_config`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConfigUpdate {
    pub enabled: Option<bool>,
    pub granted_permissions: Option<Vec<Permission>>,
    /// Replaces the whole custom blob
    pub custom_config: Option<Map<String, Value>>,
}

impl RuntimeConfigUpdate {
    fn apply(self, config: &mut RuntimeConfig) {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(granted) = self.granted_permissions {
            config.granted_permissions = granted;
        }
        if let Some(custom) = self.custom_config {
            config.custom_config = Some(custom);
        }
    }
}

impl PluginService {
    // ==================== Declared permissions ====================

    pub async fn get_permissions(&self, id: &str) -> PluginResult<Vec<Permission>> {
        self.with_plugin(id, |p| p.manifest.permissions.clone())
            .await
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Replace the declared list in memory
    ///
    /// Granted permissions that fall outside the new ceiling are revoked.
    pub async fn set_permissions(&self, id: &str, permissions: Vec<Permission>) -> PluginResult<()> {
        let granted = self
            .with_plugin_mut(id, |p| {
                p.manifest.permissions = permissions;
                p.runtime_config.granted_permissions.clone()
            })
            .await
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        let declared = self.get_permissions(id).await?;
        let kept: Vec<_> = granted.iter().copied().filter(|p| declared.contains(p)).collect();
        if kept.len() != granted.len() {
            self.set_granted_permissions(id, kept).await?;
        }
        Ok(())
    }

    /// True if every permission in `required` is declared
    pub async fn check_permissions(&self, id: &str, required: &[Permission]) -> bool {
        self.with_plugin(id, |p| required.iter().all(|r| p.manifest.permissions.contains(r)))
            .await
            .unwrap_or(false)
    }

    // ==================== Granted permissions ====================

    pub async fn get_granted_permissions(&self, id: &str) -> PluginResult<Vec<Permission>> {
        self.with_plugin(id, |p| p.runtime_config.granted_permissions.clone())
            .await
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Persist a new granted set; every entry must be declared
    pub async fn set_granted_permissions(&self, id: &str, permissions: Vec<Permission>) -> PluginResult<()> {
        let declared = self.get_permissions(id).await?;
        let undeclared: Vec<_> = permissions
            .iter()
            .filter(|p| !declared.contains(p))
            .map(Permission::as_str)
            .collect();
        if !undeclared.is_empty() {
            return Err(PluginError::Config(format!(
                "Plugin '{id}' does not declare {}",
                undeclared.join(", ")
            )));
        }

        let mut granted = Vec::with_capacity(permissions.len());
        for permission in permissions {
            if !granted.contains(&permission) {
                granted.push(permission);
            }
        }

        self.save_plugin_runtime_config(
            id,
            RuntimeConfigUpdate {
                granted_permissions: Some(granted),
                ..RuntimeConfigUpdate::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Grant one declared permission; returns false if it was already granted
    pub async fn grant_permission(&self, id: &str, permission: Permission) -> PluginResult<bool> {
        let mut granted = self.get_granted_permissions(id).await?;
        if granted.contains(&permission) {
            return Ok(false);
        }
        granted.push(permission);
        self.set_granted_permissions(id, granted).await?;
        info!(plugin_id = id, %permission, "Permission granted");
        Ok(true)
    }

    /// Revoke one permission; returns false if it was not granted
    pub async fn revoke_permission(&self, id: &str, permission: Permission) -> PluginResult<bool> {
        let mut granted = self.get_granted_permissions(id).await?;
        let before = granted.len();
        granted.retain(|p| *p != permission);
        if granted.len() == before {
            return Ok(false);
        }
        self.set_granted_permissions(id, granted).await?;
        info!(plugin_id = id, %permission, "Permission revoked");
        Ok(true)
    }

    pub async fn check_granted_permission(&self, id: &str, permission: Permission) -> bool {
        self.with_plugin(id, |p| p.runtime_config.is_granted(permission))
            .await
            .unwrap_or(false)
    }

    /// Declared minus granted
    pub async fn get_pending_permissions(&self, id: &str) -> PluginResult<Vec<Permission>> {
        self.with_plugin(id, |p| {
            permission::pending(&p.manifest.permissions, &p.runtime_config.granted_permissions)
        })
        .await
        .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    // ==================== Runtime config ====================

    pub async fn get_plugin_runtime_config(&self, id: &str) -> Option<RuntimeConfig> {
        self.with_plugin(id, |p| p.runtime_config.clone()).await
    }

    /// Merge `update`, write it beside the plugin and apply it in memory
    ///
    /// Nothing changes in memory if the write fails. A new granted set is
    /// pushed into the live context, if any.
    pub async fn save_plugin_runtime_config(
        &self,
        id: &str,
        update: RuntimeConfigUpdate,
    ) -> PluginResult<RuntimeConfig> {
        let (install_path, mut config) = self
            .with_plugin(id, |p| (p.install_path.clone(), p.runtime_config.clone()))
            .await
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        let permissions_changed = update.granted_permissions.is_some();
        let enabled_changed = update.enabled.is_some();
        update.apply(&mut config);
        self.loader.save_plugin_config(&install_path, &mut config).await?;

        self.with_plugin_mut(id, |p| {
            p.runtime_config = config.clone();
            if enabled_changed {
                p.enabled = config.enabled;
            }
            if permissions_changed {
                if let Some(context) = &p.context {
                    context.set_permissions(config.granted_permissions.iter().copied());
                }
            }
        })
        .await
        .ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        self.emit(
            topics::PLUGIN_CONFIG_CHANGED,
            json!({ "pluginId": id, "config": config }),
        );
        Ok(config)
    }
}
