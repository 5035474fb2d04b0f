//! Source-control update checks for installed plugins

use super::{OperationResult, PluginService};
use crate::git;
use crate::services::{Notification, NotificationKind};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A plugin whose working copy is behind its upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginUpdate {
    pub plugin_id: String,
    pub current_version: String,
    /// Short upstream commit
    pub latest_version: String,
}

impl PluginService {
    /// Plugins with upstream changes
    ///
    /// Git being unavailable yields an empty list. A failure for one plugin
    /// is logged and skipped.
    pub async fn check_updates(&self) -> Vec<PluginUpdate> {
        if !self.git.is_available().await {
            warn!("Git is unavailable, skipping plugin update check");
            return Vec::new();
        }

        let mut updates = Vec::new();
        for (id, version, path) in self.tracked_plugins().await {
            match self.git.check_for_updates(&path).await {
                Ok(status) if status.has_updates => {
                    let latest = status.remote_commit.get(..8).unwrap_or(&status.remote_commit);
                    updates.push(PluginUpdate {
                        plugin_id: id,
                        current_version: version,
                        latest_version: latest.to_string(),
                    });
                }
                Ok(_) => debug!(plugin_id = %id, "Plugin is up to date"),
                Err(e) => warn!(plugin_id = %id, error = %e, "Update check failed"),
            }
        }

        info!(count = updates.len(), "Plugin update check finished");
        updates
    }

    /// Pull upstream changes and reload the plugin if anything arrived
    pub async fn update_plugin_from_git(&self, id: &str) -> OperationResult {
        let Some((tracked, path)) = self
            .with_plugin(id, |p| (has_repository(p), p.install_path.clone()))
            .await
        else {
            return OperationResult::not_found(id);
        };

        if !tracked {
            return OperationResult::failed(id, format!("Plugin '{id}' is not linked to a git repository"));
        }
        if !self.git.is_available().await {
            return OperationResult::failed(id, "Git is unavailable, cannot update plugin");
        }

        match self.git.pull(&path).await {
            Ok(true) => {
                info!(plugin_id = id, "Pulled plugin update");
                self.loader.clear_cache(Some(id));
                self.reload_plugin(id).await
            }
            Ok(false) => OperationResult::ok(id, format!("Plugin '{id}' is already up to date")),
            Err(e) => OperationResult::from_error(id, &e),
        }
    }

    /// Background update routine run after startup
    ///
    /// Gated by the update settings; reports through the UI collaborator
    /// when one is wired, otherwise only logs. Never fails.
    pub async fn auto_check_and_update(&self) {
        let updates_settings = &self.settings.updates;
        if !updates_settings.auto_check {
            debug!("Automatic plugin update check is disabled");
            return;
        }

        if !self.git.is_available().await {
            warn!("Git is unavailable, skipping automatic plugin update");
            self.notify(
                "Git unavailable",
                "Git is not available, plugin updates cannot be checked.",
                NotificationKind::Warning,
            );
            return;
        }

        let updates = self.check_updates().await;
        if updates.is_empty() {
            self.notify("Plugin updates", "All plugins are up to date", NotificationKind::Info);
            return;
        }

        self.notify(
            "Plugin updates available",
            &format!("{} plugin(s) can be updated", updates.len()),
            NotificationKind::Info,
        );
        if !updates_settings.auto_update {
            return;
        }

        let (mut updated, mut failed) = (0, 0);
        for update in &updates {
            let result = self.update_plugin_from_git(&update.plugin_id).await;
            if result.success {
                updated += 1;
            } else {
                failed += 1;
                warn!(plugin_id = %update.plugin_id, reason = %result.message, "Automatic update failed");
            }
        }

        info!(updated, failed, "Automatic plugin update finished");
        let kind = if failed == 0 {
            NotificationKind::Info
        } else {
            NotificationKind::Warning
        };
        self.notify(
            "Plugin update finished",
            &format!("{updated} updated, {failed} failed"),
            kind,
        );
    }

    async fn tracked_plugins(&self) -> Vec<(String, String, PathBuf)> {
        let plugins = self.plugins.read().await;
        let mut tracked: Vec<_> = plugins
            .values()
            .filter(|p| has_repository(p))
            .map(|p| (p.manifest.id.clone(), p.manifest.version.clone(), p.install_path.clone()))
            .collect();
        tracked.sort();
        tracked
    }

    fn notify(&self, title: &str, message: &str, kind: NotificationKind) {
        let Some(ui) = &self.services.ui else {
            info!(title, message, "Plugin update notice");
            return;
        };
        let notification = Notification {
            title: title.to_string(),
            message: message.to_string(),
            kind,
        };
        if let Err(e) = ui.show_notification(&notification) {
            warn!(error = %e, "Failed to show update notification");
        }
    }
}

fn has_repository(plugin: &super::Plugin) -> bool {
    plugin.manifest.repository.as_deref().is_some_and(|r| !r.is_empty())
        || git::is_git_repository(&plugin.install_path)
}
