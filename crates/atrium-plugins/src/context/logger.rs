//! Plugin-scoped logging handle

use tracing::{debug, error, info, warn};

const TARGET: &str = "atrium::plugin";

/// Forwards plugin log lines to `tracing` tagged with the plugin id
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: String,
}

impl PluginLogger {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn debug(&self, message: &str) {
        debug!(target: TARGET, plugin_id = %self.plugin_id, "{message}");
    }

    pub fn info(&self, message: &str) {
        info!(target: TARGET, plugin_id = %self.plugin_id, "{message}");
    }

    pub fn warn(&self, message: &str) {
        warn!(target: TARGET, plugin_id = %self.plugin_id, "{message}");
    }

    pub fn error(&self, message: &str) {
        error!(target: TARGET, plugin_id = %self.plugin_id, "{message}");
    }

    /// Log at a level named by the plugin; unknown names log at info
    pub fn log(&self, level: &str, message: &str) {
        match level {
            "debug" => self.debug(message),
            "warn" => self.warn(message),
            "error" => self.error(message),
            _ => self.info(message),
        }
    }
}
