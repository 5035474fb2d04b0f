//! Error types for the plugin runtime

use crate::lifecycle::PluginState;
use crate::permission::Permission;
use thiserror::Error;

/// Result type alias using the runtime's [`PluginError`]
pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Result type alias for sandbox operations
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Plugin runtime error types
#[derive(Error, Debug)]
pub enum PluginError {
    // Admission errors (E500-E519)
    #[error("Manifest validation failed: {0}")]
    ManifestValidation(String),

    #[error("Dependency check failed for '{plugin_id}': {reason}")]
    Dependency { plugin_id: String, reason: String },

    #[error("Plugin '{plugin_id}' conflicts with installed plugins: {}", reasons.join("; "))]
    Conflict {
        plugin_id: String,
        reasons: Vec<String>,
    },

    #[error("Plugin '{0}' is already installed")]
    AlreadyInstalled(String),

    // Loading errors (E520-E539)
    #[error("Failed to load plugin '{plugin_id}': {cause}")]
    Loader { plugin_id: String, cause: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    // Lifecycle errors (E540-E559)
    #[error("Plugin '{0}' not found")]
    NotFound(String),

    #[error("Invalid state transition for plugin '{plugin_id}': {from} -> {to}")]
    TransitionRejected {
        plugin_id: String,
        from: PluginState,
        to: PluginState,
    },

    // Capability errors (E560-E579)
    #[error("Permission denied: plugin '{plugin_id}' requires '{permission}'")]
    PermissionDenied {
        plugin_id: String,
        permission: Permission,
    },

    #[error("Access denied: path '{path}' is outside the install directory of plugin '{plugin_id}'")]
    PathEscape { plugin_id: String, path: String },

    #[error("{0} service is not available")]
    ServiceUnavailable(String),

    #[error("{service} service failed: {cause}")]
    Service { service: String, cause: String },

    #[error("Event '{0}' is reserved for the host")]
    ReservedEvent(String),

    #[error("Plugin '{plugin_id}' has no access to the {api} API")]
    ApiUnavailable { plugin_id: String, api: String },

    #[error("Invalid host call: {0}")]
    InvalidHostCall(String),

    // Source control errors (E580-E589)
    #[error("Git is not available. Install Git to add plugins from repositories.")]
    GitUnavailable,

    #[error("Git operation failed: {0}")]
    Git(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ManifestValidation(_) => "E500",
            Self::Dependency { .. } => "E501",
            Self::Conflict { .. } => "E502",
            Self::AlreadyInstalled(_) => "E503",
            Self::Loader { .. } => "E520",
            Self::Sandbox(_) => "E521",
            Self::NotFound(_) => "E540",
            Self::TransitionRejected { .. } => "E541",
            Self::PermissionDenied { .. } => "E560",
            Self::PathEscape { .. } => "E561",
            Self::ServiceUnavailable(_) => "E562",
            Self::Service { .. } => "E563",
            Self::ReservedEvent(_) => "E564",
            Self::ApiUnavailable { .. } => "E565",
            Self::InvalidHostCall(_) => "E566",
            Self::GitUnavailable => "E580",
            Self::Git(_) => "E581",
            Self::Config(_) => "E600",
            Self::Io(_) => "E610",
            Self::Json(_) => "E611",
        }
    }

    pub(crate) fn service(service: &str, cause: impl std::fmt::Display) -> Self {
        Self::Service {
            service: service.to_string(),
            cause: cause.to_string(),
        }
    }

    pub(crate) fn loader(plugin_id: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Loader {
            plugin_id: plugin_id.into(),
            cause: cause.to_string(),
        }
    }
}

/// Failures raised while creating or running a sandboxed plugin
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("No sandbox context exists for plugin '{plugin_id}'")]
    ContextMissing { plugin_id: String },

    #[error("Plugin '{plugin_id}' may not import module '{module}'")]
    ForbiddenModule { plugin_id: String, module: String },

    #[error("Plugin '{plugin_id}' failed to compile: {cause}")]
    Compile { plugin_id: String, cause: String },

    #[error("Plugin '{plugin_id}' failed to instantiate: {cause}")]
    Instantiate { plugin_id: String, cause: String },

    #[error("Plugin '{plugin_id}' raised an error: {cause}")]
    Execution { plugin_id: String, cause: String },

    #[error("Plugin '{plugin_id}' exceeded its {timeout_ms}ms execution budget")]
    Timeout { plugin_id: String, timeout_ms: u64 },

    #[error("Sandbox engine error: {0}")]
    Engine(String),
}

impl SandboxError {
    /// The plugin the failure belongs to, if any
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::ContextMissing { plugin_id }
            | Self::ForbiddenModule { plugin_id, .. }
            | Self::Compile { plugin_id, .. }
            | Self::Instantiate { plugin_id, .. }
            | Self::Execution { plugin_id, .. }
            | Self::Timeout { plugin_id, .. } => Some(plugin_id),
            Self::Engine(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(PluginError::NotFound("x".into()).code(), "E540");
        assert_eq!(PluginError::GitUnavailable.code(), "E580");
        assert_eq!(
            PluginError::TransitionRejected {
                plugin_id: "x".into(),
                from: PluginState::Unloaded,
                to: PluginState::Active,
            }
            .code(),
            "E541"
        );
    }

    #[test]
    fn test_transition_rejected_names_both_states() {
        let err = PluginError::TransitionRejected {
            plugin_id: "demo".into(),
            from: PluginState::Unloaded,
            to: PluginState::Active,
        };
        let message = err.to_string();
        assert!(message.contains("unloaded -> active"));
        assert!(message.contains("demo"));
    }

    #[test]
    fn test_conflict_joins_reasons() {
        let err = PluginError::Conflict {
            plugin_id: "a".into(),
            reasons: vec!["one".into(), "two".into()],
        };
        assert!(err.to_string().ends_with("one; two"));
    }

    #[test]
    fn test_sandbox_error_carries_plugin_id() {
        let err = SandboxError::Timeout {
            plugin_id: "slow".into(),
            timeout_ms: 5000,
        };
        assert_eq!(err.plugin_id(), Some("slow"));
        assert!(err.to_string().contains("5000ms"));
        assert_eq!(SandboxError::Engine("boom".into()).plugin_id(), None);

        let wrapped: PluginError = err.into();
        assert_eq!(wrapped.code(), "E521");
    }
}
