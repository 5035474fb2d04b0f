//! Plugin lifecycle states and the transition table

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a registered plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Initialized,
    Activating,
    Active,
    Deactivating,
    Inactive,
    Error,
}

impl PluginState {
    pub const ALL: [PluginState; 10] = [
        Self::Unloaded,
        Self::Loading,
        Self::Loaded,
        Self::Initializing,
        Self::Initialized,
        Self::Activating,
        Self::Active,
        Self::Deactivating,
        Self::Inactive,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }

    /// States reachable from `self` in one step
    pub fn allowed_transitions(&self) -> &'static [PluginState] {
        use PluginState::*;
        match self {
            Unloaded => &[Loading, Error],
            Loading => &[Loaded, Error],
            Loaded => &[Initializing, Unloaded, Error],
            Initializing => &[Initialized, Error],
            Initialized => &[Activating, Unloaded, Error],
            Activating => &[Active, Error],
            Active => &[Deactivating, Error],
            Deactivating => &[Inactive, Error],
            Inactive => &[Activating, Unloaded, Error],
            Error => &[Unloaded, Loading],
        }
    }

    pub fn can_transition(&self, to: PluginState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// States in which a module instance and context exist
    pub fn has_instance(&self) -> bool {
        matches!(
            self,
            Self::Initialized | Self::Activating | Self::Active | Self::Deactivating | Self::Inactive
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
