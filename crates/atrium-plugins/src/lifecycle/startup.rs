//! Host-driven startup and shutdown sequences

use super::{PluginService, PluginState};
use crate::events::topics;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Counts from one startup sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub discovered: usize,
    pub activated: usize,
    pub failed: usize,
}

impl PluginService {
    /// Discover, then bring every enabled plugin up in id order
    ///
    /// One plugin failing never stops the others. When update checks are
    /// enabled, the check runs in the background after the configured delay
    /// and its handle is returned.
    pub async fn on_app_ready(self: &Arc<Self>) -> (StartupReport, Option<JoinHandle<()>>) {
        self.emit(topics::APP_READY, json!({}));
        if let Err(e) = self.loader.ensure_roots().await {
            warn!(error = %e, "Failed to create plugin roots");
        }

        let mut report = StartupReport {
            discovered: self.discover_plugins().await,
            ..StartupReport::default()
        };

        for id in self.ids_where(|p| p.enabled).await {
            let results = self.start_plugin(&id).await;
            match results.iter().find(|r| !r.success) {
                None => report.activated += 1,
                Some(failure) => {
                    report.failed += 1;
                    warn!(plugin_id = %id, reason = %failure.message, "Plugin failed to start");
                }
            }
        }

        info!(
            discovered = report.discovered,
            activated = report.activated,
            failed = report.failed,
            "Plugin startup finished"
        );

        let updates = &self.settings.updates;
        let handle = updates.auto_check.then(|| {
            let service = Arc::clone(self);
            let delay = Duration::from_secs(updates.check_delay_secs);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                service.auto_check_and_update().await;
            })
        });

        (report, handle)
    }

    /// Deactivate every active plugin; returns how many were deactivated
    pub async fn on_app_before_quit(&self) -> usize {
        self.emit(topics::APP_BEFORE_QUIT, json!({}));

        let mut deactivated = 0;
        for id in self.ids_where(|p| p.state == PluginState::Active).await {
            let result = self.deactivate_plugin(&id).await;
            if result.success {
                deactivated += 1;
            } else {
                warn!(plugin_id = %id, reason = %result.message, "Plugin failed to deactivate on quit");
            }
        }

        info!(deactivated, "Plugins shut down");
        deactivated
    }
}
