//! Discovery, installation and removal of plugins

use super::{OperationResult, Plugin, PluginInfo, PluginService, PluginState};
use crate::dependency;
use crate::error::{PluginError, PluginResult};
use crate::events::topics;
use crate::git::{self, RepositoryInfo};
use crate::loader::RootKind;
use crate::manifest::{self, Manifest};
use crate::runtime_config::RuntimeConfig;
use serde_json::json;
use std::path::Path;
use tracing::{info, warn};

impl PluginService {
    /// Register every plugin found under the roots that is not yet known
    ///
    /// Returns the number of newly registered plugins.
    pub async fn discover_plugins(&self) -> usize {
        let discovered = self.loader.scan_for_plugins().await;
        let mut added = 0;

        for found in discovered {
            let id = found.manifest.id.clone();
            if self.is_registered(&id).await {
                continue;
            }

            let runtime_config = self.loader.load_plugin_config(&found.directory).await;
            let plugin = Plugin::new(found.manifest, found.directory, found.root, runtime_config);

            let mut plugins = self.plugins.write().await;
            if plugins.contains_key(&id) {
                continue;
            }
            plugins.insert(id, plugin);
            added += 1;
        }

        info!(added, "Plugin discovery finished");
        added
    }

    /// Install from a local directory or a remote repository URL
    ///
    /// A supplied `manifest` replaces the one in the source directory.
    pub async fn install_plugin(&self, source: &str, manifest: Option<Manifest>) -> PluginResult<PluginInfo> {
        if git::is_git_url(source) {
            return self.install_from_git(source.trim()).await;
        }
        self.install_from_dir(Path::new(source), manifest, None).await
    }

    async fn install_from_dir(
        &self,
        source: &Path,
        manifest: Option<Manifest>,
        provenance: Option<(&str, &RepositoryInfo)>,
    ) -> PluginResult<PluginInfo> {
        let mut manifest = match manifest {
            Some(manifest) => {
                manifest::validate(&manifest, source)?;
                manifest
            }
            None => self.loader.read_manifest(source).await?,
        };
        let id = manifest.id.clone();

        let installed = self.installed().await;
        if installed.contains_key(&id) {
            return Err(PluginError::AlreadyInstalled(id));
        }
        let reasons = dependency::check_conflicts(&manifest, &installed);
        if !reasons.is_empty() {
            return Err(PluginError::Conflict { plugin_id: id, reasons });
        }

        let target = self.loader.install_plugin_files(source, &id, RootKind::User).await?;

        let mut runtime_config = RuntimeConfig::default();
        if let Some((url, repo)) = provenance {
            if manifest.repository.as_deref().is_none_or(str::is_empty) {
                manifest.repository = Some(url.to_string());
            }
            runtime_config.set_custom("gitUrl", json!(url));
            runtime_config.set_custom("gitCommit", json!(repo.commit));
            runtime_config.set_custom("clonedAt", json!(chrono::Utc::now().timestamp_millis()));
        }
        if let Err(e) = self.loader.save_plugin_config(&target, &mut runtime_config).await {
            warn!(plugin_id = %id, error = %e, "Failed to write initial plugin config");
        }

        let plugin = Plugin::new(manifest, target, RootKind::User, runtime_config);
        let info = plugin.info();
        {
            let mut plugins = self.plugins.write().await;
            if plugins.contains_key(&id) {
                return Err(PluginError::AlreadyInstalled(id));
            }
            plugins.insert(id.clone(), plugin);
        }

        info!(plugin_id = %id, version = %info.manifest.version, "Plugin installed");
        self.emit(
            topics::PLUGIN_INSTALLED,
            json!({ "pluginId": id, "manifest": info.manifest }),
        );
        Ok(info)
    }

    async fn install_from_git(&self, url: &str) -> PluginResult<PluginInfo> {
        if !self.git.is_available().await {
            return Err(PluginError::GitUnavailable);
        }

        let temp = self.git.create_temp_dir().await?;
        let installed = async {
            let repo = self.git.clone_shallow(url, &temp).await?;
            info!(url, commit = repo.short_commit(), "Cloned plugin repository");
            self.install_from_dir(&temp, None, Some((url, &repo))).await
        }
        .await;

        if let Err(e) = self.git.cleanup_temp_dir(&temp).await {
            warn!(directory = %temp.display(), error = %e, "Failed to clean up clone directory");
        }
        installed
    }

    /// Unload, delete the install directory and forget the plugin
    ///
    /// If the directory cannot be removed the registry entry is kept.
    pub async fn uninstall_plugin(&self, id: &str) -> OperationResult {
        let Some(install_path) = self.install_path(id).await else {
            return OperationResult::not_found(id);
        };

        if self.get_plugin_state(id).await.ok() != Some(PluginState::Unloaded) {
            let unloaded = self.unload_plugin(id).await;
            if !unloaded.success {
                warn!(plugin_id = id, reason = %unloaded.message, "Unload failed, releasing plugin resources");
                let transient = self
                    .with_plugin_mut(id, |p| p.take_transient())
                    .await
                    .unwrap_or((None, None));
                self.release(transient.0, transient.1);
            }
        }

        if let Err(e) = self.loader.remove_plugin_dir(id, &install_path).await {
            return OperationResult::from_error(id, &e);
        }

        self.plugins.write().await.remove(id);
        self.loader.clear_cache(Some(id));

        info!(plugin_id = id, "Plugin uninstalled");
        self.emit(topics::PLUGIN_UNINSTALLED, json!({ "pluginId": id }));
        OperationResult::ok(id, format!("Plugin '{id}' uninstalled"))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::*;
    use crate::git::GitService;
    use crate::manifest::MANIFEST_FILE;
    use crate::runtime_config::RUNTIME_CONFIG_FILE;
    use std::fs;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_discover_registers_once() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(&tmp.path().join("roots/system/alpha"), "alpha", json!({}));
        write_plugin(&tmp.path().join("roots/dev/beta"), "beta", json!({}));
        let service = service(tmp.path());

        assert_eq!(service.discover_plugins().await, 2);
        assert_eq!(service.discover_plugins().await, 0);

        let alpha = service.get_plugin("alpha").await.unwrap();
        assert_eq!(alpha.state, PluginState::Unloaded);
        assert_eq!(alpha.root, RootKind::System);
        assert!(!alpha.enabled);
        assert!(tmp.path().join("roots/system/alpha").join(RUNTIME_CONFIG_FILE).is_file());
    }

    #[tokio::test]
    async fn test_install_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("incoming/gamma");
        write_plugin(&source, "gamma", json!({}));
        let service = service(tmp.path());

        let info = service
            .install_plugin(source.to_str().unwrap(), None)
            .await
            .expect("install");
        assert_eq!(info.id, "gamma");
        assert_eq!(info.root, RootKind::User);
        assert_eq!(info.state, PluginState::Unloaded);
        assert_eq!(info.runtime_config, RuntimeConfig {
            updated_at: info.runtime_config.updated_at,
            ..RuntimeConfig::default()
        });
        assert!(tmp.path().join("roots/user/gamma").join(MANIFEST_FILE).is_file());

        let err = service
            .install_plugin(source.to_str().unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::AlreadyInstalled(ref id) if id == "gamma"));
    }

    #[tokio::test]
    async fn test_install_rejects_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(&tmp.path().join("roots/system/alpha"), "alpha", json!({"conflicts": ["delta"]}));
        let source = tmp.path().join("incoming/delta");
        write_plugin(&source, "delta", json!({}));
        let service = service(tmp.path());
        service.discover_plugins().await;

        let err = service
            .install_plugin(source.to_str().unwrap(), None)
            .await
            .unwrap_err();
        match err {
            PluginError::Conflict { plugin_id, reasons } => {
                assert_eq!(plugin_id, "delta");
                assert_eq!(reasons.len(), 1);
                assert!(reasons[0].contains("alpha"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!tmp.path().join("roots/user/delta").exists());
        assert!(service.get_plugin("delta").await.is_none());
    }

    #[tokio::test]
    async fn test_install_with_supplied_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("incoming/raw");
        write_plugin(&source, "raw", json!({}));
        fs::remove_file(source.join(MANIFEST_FILE)).unwrap();
        let service = service(tmp.path());

        let manifest = manifest_for("renamed", json!({}));
        let info = service
            .install_plugin(source.to_str().unwrap(), Some(manifest))
            .await
            .expect("install");
        assert_eq!(info.id, "renamed");
        assert!(tmp.path().join("roots/user/renamed/index.wat").is_file());
    }

    #[tokio::test]
    async fn test_git_unavailable_leaves_registry_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service_with_git(tmp.path(), Arc::new(StubGit::unavailable()));

        let err = service
            .install_plugin("https://example.com/plugin.git", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::GitUnavailable));
        assert!(service.get_plugins().await.is_empty());
    }

    #[tokio::test]
    async fn test_git_install_records_provenance_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let git = Arc::new(StubGit::cloning("cloned", tmp.path().join("clones")));
        let service = service_with_git(tmp.path(), git.clone());

        let info = service
            .install_plugin("https://example.com/cloned.git", None)
            .await
            .expect("git install");
        assert_eq!(info.manifest.repository.as_deref(), Some("https://example.com/cloned.git"));
        assert_eq!(
            info.runtime_config.custom("gitCommit"),
            Some(&json!("0123456789abcdef"))
        );
        assert!(info.runtime_config.custom("clonedAt").is_some());

        let temp = git.last_temp_dir().expect("temp dir created");
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_failed_git_install_still_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let git = Arc::new(StubGit::failing_clone(tmp.path().join("clones")));
        let service = service_with_git(tmp.path(), git.clone());

        let err = service
            .install_plugin("git@example.com:team/plugin.git", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Git(_)));
        assert!(!git.last_temp_dir().unwrap().exists());
        assert!(git.is_available().await);
    }

    #[tokio::test]
    async fn test_uninstall_removes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(&tmp.path().join("roots/user/alpha"), "alpha", json!({}));
        let service = service(tmp.path());
        service.discover_plugins().await;
        assert!(service.enable_plugin("alpha").await.success);

        let result = service.uninstall_plugin("alpha").await;
        assert!(result.success, "{}", result.message);
        assert!(service.get_plugin("alpha").await.is_none());
        assert!(!tmp.path().join("roots/user/alpha").exists());
        assert!(service.loader().cached_manifest("alpha").is_none());

        let again = service.uninstall_plugin("alpha").await;
        assert!(!again.success);
        assert_eq!(again.error.as_deref(), Some("E540"));
    }
}
