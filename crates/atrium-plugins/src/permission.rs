//! Capability permissions
//!
//! Permissions form a closed set of string tokens. A plugin declares the
//! permissions it wants in its manifest (the ceiling) and the host grants a
//! subset of them at runtime through the plugin's runtime config.

use crate::error::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// A single capability a plugin may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "entities:get-types")]
    EntitiesGetTypes,
    #[serde(rename = "entities:get-type")]
    EntitiesGetType,
    #[serde(rename = "entities:list")]
    EntitiesList,
    #[serde(rename = "entities:get")]
    EntitiesGet,
    #[serde(rename = "entities:create")]
    EntitiesCreate,
    #[serde(rename = "entities:update")]
    EntitiesUpdate,
    #[serde(rename = "entities:delete")]
    EntitiesDelete,
    #[serde(rename = "files:open")]
    FilesOpen,
    #[serde(rename = "files:save")]
    FilesSave,
    #[serde(rename = "config:read")]
    ConfigRead,
    #[serde(rename = "config:write")]
    ConfigWrite,
    #[serde(rename = "ui:show")]
    UiShow,
    #[serde(rename = "ui:modify")]
    UiModify,
    #[serde(rename = "events:subscribe")]
    EventsSubscribe,
    #[serde(rename = "network:access")]
    NetworkAccess,
    #[serde(rename = "plugins:load")]
    PluginsLoad,
    #[serde(rename = "plugins:unload")]
    PluginsUnload,
    #[serde(rename = "plugins:reload")]
    PluginsReload,
    #[serde(rename = "plugins:activate")]
    PluginsActivate,
    #[serde(rename = "plugins:deactivate")]
    PluginsDeactivate,
}

/// The sub-API a permission unlocks on a plugin context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityGroup {
    Entities,
    Files,
    Config,
    Ui,
    Events,
    Network,
    Lifecycle,
}

impl Permission {
    pub const ALL: [Permission; 20] = [
        Self::EntitiesGetTypes,
        Self::EntitiesGetType,
        Self::EntitiesList,
        Self::EntitiesGet,
        Self::EntitiesCreate,
        Self::EntitiesUpdate,
        Self::EntitiesDelete,
        Self::FilesOpen,
        Self::FilesSave,
        Self::ConfigRead,
        Self::ConfigWrite,
        Self::UiShow,
        Self::UiModify,
        Self::EventsSubscribe,
        Self::NetworkAccess,
        Self::PluginsLoad,
        Self::PluginsUnload,
        Self::PluginsReload,
        Self::PluginsActivate,
        Self::PluginsDeactivate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntitiesGetTypes => "entities:get-types",
            Self::EntitiesGetType => "entities:get-type",
            Self::EntitiesList => "entities:list",
            Self::EntitiesGet => "entities:get",
            Self::EntitiesCreate => "entities:create",
            Self::EntitiesUpdate => "entities:update",
            Self::EntitiesDelete => "entities:delete",
            Self::FilesOpen => "files:open",
            Self::FilesSave => "files:save",
            Self::ConfigRead => "config:read",
            Self::ConfigWrite => "config:write",
            Self::UiShow => "ui:show",
            Self::UiModify => "ui:modify",
            Self::EventsSubscribe => "events:subscribe",
            Self::NetworkAccess => "network:access",
            Self::PluginsLoad => "plugins:load",
            Self::PluginsUnload => "plugins:unload",
            Self::PluginsReload => "plugins:reload",
            Self::PluginsActivate => "plugins:activate",
            Self::PluginsDeactivate => "plugins:deactivate",
        }
    }

    pub fn group(&self) -> CapabilityGroup {
        match self {
            Self::EntitiesGetTypes
            | Self::EntitiesGetType
            | Self::EntitiesList
            | Self::EntitiesGet
            | Self::EntitiesCreate
            | Self::EntitiesUpdate
            | Self::EntitiesDelete => CapabilityGroup::Entities,
            Self::FilesOpen | Self::FilesSave => CapabilityGroup::Files,
            Self::ConfigRead | Self::ConfigWrite => CapabilityGroup::Config,
            Self::UiShow | Self::UiModify => CapabilityGroup::Ui,
            Self::EventsSubscribe => CapabilityGroup::Events,
            Self::NetworkAccess => CapabilityGroup::Network,
            Self::PluginsLoad
            | Self::PluginsUnload
            | Self::PluginsReload
            | Self::PluginsActivate
            | Self::PluginsDeactivate => CapabilityGroup::Lifecycle,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Permission {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| PluginError::Config(format!("Unknown permission '{s}'")))
    }
}

/// Live, shared set of granted permissions
///
/// Clones share the same underlying set, so a revocation made through one
/// handle is observed by every capability API holding another.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    inner: Arc<RwLock<BTreeSet<Permission>>>,
}

impl PermissionSet {
    pub fn new(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(permissions.into_iter().collect())),
        }
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.read().contains(&permission)
    }

    /// True if any permission belonging to `group` is held
    pub fn any_in(&self, group: CapabilityGroup) -> bool {
        self.read().iter().any(|p| p.group() == group)
    }

    pub fn insert(&self, permission: Permission) -> bool {
        self.write().insert(permission)
    }

    pub fn remove(&self, permission: Permission) -> bool {
        self.write().remove(&permission)
    }

    pub fn replace(&self, permissions: impl IntoIterator<Item = Permission>) {
        *self.write() = permissions.into_iter().collect();
    }

    pub fn to_vec(&self) -> Vec<Permission> {
        self.read().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Fail with [`PluginError::PermissionDenied`] unless `permission` is held
    pub fn require(&self, plugin_id: &str, permission: Permission) -> PluginResult<()> {
        if self.contains(permission) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied {
                plugin_id: plugin_id.to_string(),
                permission,
            })
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeSet<Permission>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeSet<Permission>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Declared permissions that have not been granted, in declaration order
pub fn pending(declared: &[Permission], granted: &[Permission]) -> Vec<Permission> {
    let mut seen = BTreeSet::new();
    declared
        .iter()
        .copied()
        .filter(|p| !granted.contains(p) && seen.insert(*p))
        .collect()
}
