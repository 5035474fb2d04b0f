//! The runtime plugin record and its public snapshot

use super::state::PluginState;
use crate::context::PluginContext;
use crate::error::PluginError;
use crate::loader::{PluginModule, RootKind};
use crate::manifest::Manifest;
use crate::runtime_config::RuntimeConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::error::Error as _;
use std::path::PathBuf;
use std::sync::Arc;

/// Last failure recorded against a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginErrorRecord {
    pub code: String,
    pub message: String,
    /// Source chain of the error, outermost first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PluginErrorRecord {
    pub fn from_error(error: &PluginError) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\ncaused by: ")),
            timestamp: Utc::now(),
        }
    }
}

/// A registered plugin, owned by the registry in [`super::PluginService`]
///
/// `module` and `context` only exist while the plugin is initialized.
#[derive(Debug)]
pub struct Plugin {
    pub manifest: Manifest,
    pub install_path: PathBuf,
    pub root: RootKind,
    pub installed_at: DateTime<Utc>,
    pub state: PluginState,
    pub enabled: bool,
    pub error: Option<PluginErrorRecord>,
    pub runtime_config: RuntimeConfig,
    pub(crate) module: Option<PluginModule>,
    pub(crate) context: Option<Arc<PluginContext>>,
}

impl Plugin {
    pub(crate) fn new(
        manifest: Manifest,
        install_path: PathBuf,
        root: RootKind,
        runtime_config: RuntimeConfig,
    ) -> Self {
        Self {
            manifest,
            install_path,
            root,
            installed_at: Utc::now(),
            state: PluginState::Unloaded,
            enabled: runtime_config.enabled,
            error: None,
            runtime_config,
            module: None,
            context: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn context(&self) -> Option<&Arc<PluginContext>> {
        self.context.as_ref()
    }

    /// Drop the module and context, returning them for cleanup
    pub(crate) fn take_transient(&mut self) -> (Option<PluginModule>, Option<Arc<PluginContext>>) {
        (self.module.take(), self.context.take())
    }

    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.manifest.id.clone(),
            manifest: self.manifest.clone(),
            install_path: self.install_path.clone(),
            root: self.root,
            installed_at: self.installed_at,
            state: self.state,
            enabled: self.enabled,
            error: self.error.clone(),
            runtime_config: self.runtime_config.clone(),
            has_context: self.context.is_some(),
        }
    }
}

/// Serialisable snapshot of a [`Plugin`] without its transient fields
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub id: String,
    pub manifest: Manifest,
    pub install_path: PathBuf,
    pub root: RootKind,
    pub installed_at: DateTime<Utc>,
    pub state: PluginState,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PluginErrorRecord>,
    pub runtime_config: RuntimeConfig,
    pub has_context: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;

    #[test]
    fn test_error_record_keeps_source_chain() {
        let err = PluginError::Sandbox(SandboxError::Timeout {
            plugin_id: "x".into(),
            timeout_ms: 5000,
        });
        let record = PluginErrorRecord::from_error(&err);
        assert_eq!(record.code, "E521");
        assert!(record.message.contains("5000"));

        let io = PluginError::Io(std::io::Error::other("disk on fire"));
        assert_eq!(PluginErrorRecord::from_error(&io).code, "E610");
    }
}
