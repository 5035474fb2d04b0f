//! Notifications, dialogs and external links

use crate::error::{PluginError, PluginResult};
use crate::permission::{Permission, PermissionSet};
use crate::services::{Dialog, DialogKind, Notification, NotificationKind, UiService};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

const SERVICE: &str = "UI";

/// Notification request in the plugin-facing vocabulary
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationOptions {
    pub title: String,
    pub message: String,
    /// `success`, `info`, `warning` or `error`
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Dialog request in the plugin-facing vocabulary
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DialogOptions {
    pub title: String,
    pub message: String,
    /// `alert`, `confirm` or `prompt`
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub buttons: Vec<String>,
}

#[derive(Clone)]
pub struct UiApi {
    plugin_id: String,
    permissions: PermissionSet,
    service: Option<Arc<dyn UiService>>,
}

impl UiApi {
    pub(crate) fn new(plugin_id: &str, permissions: PermissionSet, service: Option<Arc<dyn UiService>>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            permissions,
            service,
        }
    }

    pub fn show_notification(&self, options: NotificationOptions) -> PluginResult<()> {
        let service = self.gate()?;
        let notification = Notification {
            title: options.title,
            message: options.message,
            kind: NotificationKind::from_plugin(options.kind.as_deref()),
        };
        service.show_notification(&notification).map_err(failed)
    }

    /// Returns the index of the chosen button
    pub fn show_dialog(&self, options: DialogOptions) -> PluginResult<usize> {
        let service = self.gate()?;
        let dialog = Dialog {
            title: options.title,
            message: options.message,
            kind: DialogKind::from_plugin(options.kind.as_deref()),
            buttons: options.buttons,
        };
        service.show_dialog(&dialog).map_err(failed)
    }

    pub fn open_external(&self, url: &str) -> PluginResult<()> {
        let service = self.gate()?;
        info!(plugin_id = %self.plugin_id, url, "Plugin opening external link");
        service.open_external(url).map_err(failed)
    }

    fn gate(&self) -> PluginResult<&Arc<dyn UiService>> {
        self.permissions.require(&self.plugin_id, Permission::UiShow)?;
        self.service
            .as_ref()
            .ok_or_else(|| PluginError::ServiceUnavailable(SERVICE.to_string()))
    }
}

fn failed(e: anyhow::Error) -> PluginError {
    PluginError::service(SERVICE, format!("{e:#}"))
}
