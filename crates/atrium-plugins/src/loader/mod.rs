//! Plugin loading and discovery
//!
//! The loader owns everything that touches plugin files: scanning the three
//! plugin roots, copying plugin trees in and out, resolving entry files and
//! handing modules to either the [`Sandbox`] or the direct runtime.

mod direct;

use crate::context::files::resolve_contained;
use crate::error::{PluginError, PluginResult};
use crate::manifest::{self, MANIFEST_FILE, Manifest};
use crate::runtime_config::{self, RuntimeConfig};
use crate::sandbox::{EmptyHostApi, HostApi, Sandbox};
use crate::settings::{RootSettings, RuntimeSettings};
use direct::DirectRuntime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Entry file used when the manifest declares none
pub const DEFAULT_ENTRY: &str = "index.wasm";

/// Recognised entry extensions; anything else gets `.wasm` appended
pub const ENTRY_EXTENSIONS: [&str; 2] = [".wasm", ".wat"];

/// One of the three plugin root directories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootKind {
    System,
    User,
    Dev,
}

impl RootKind {
    /// Scan priority order
    pub const ALL: [RootKind; 3] = [Self::System, Self::User, Self::Dev];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Dev => "dev",
        }
    }
}

impl std::fmt::Display for RootKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A plugin found on disk during a scan
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub manifest: Manifest,
    pub directory: PathBuf,
    pub root: RootKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Sandboxed,
    Direct,
}

/// Handle to a loaded plugin module; equivalent for both runtimes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginModule {
    pub plugin_id: String,
    pub entry: PathBuf,
    pub exports: Vec<String>,
    pub runtime: RuntimeKind,
}

impl PluginModule {
    pub fn has_export(&self, name: &str) -> bool {
        self.exports.iter().any(|e| e == name)
    }
}

pub struct PluginLoader {
    roots: RootSettings,
    sandbox: Option<Sandbox>,
    direct: DirectRuntime,
    manifests: RwLock<HashMap<String, Manifest>>,
}

impl PluginLoader {
    pub fn new(settings: &RuntimeSettings) -> PluginResult<Self> {
        let sandbox = if settings.sandbox.enabled {
            Some(Sandbox::new(settings.sandbox.clone())?)
        } else {
            warn!("Plugin sandbox is disabled; plugin modules run without execution limits");
            None
        };

        Ok(Self {
            roots: settings.roots.clone(),
            sandbox,
            direct: DirectRuntime::new(Duration::from_millis(settings.sandbox.max_timer_delay_ms))?,
            manifests: RwLock::new(HashMap::new()),
        })
    }

    pub fn sandbox_enabled(&self) -> bool {
        self.sandbox.is_some()
    }

    pub fn sandbox(&self) -> Option<&Sandbox> {
        self.sandbox.as_ref()
    }

    pub fn root_dir(&self, kind: RootKind) -> &Path {
        match kind {
            RootKind::System => &self.roots.system,
            RootKind::User => &self.roots.user,
            RootKind::Dev => &self.roots.dev,
        }
    }

    pub fn plugin_dir(&self, plugin_id: &str, kind: RootKind) -> PathBuf {
        self.root_dir(kind).join(plugin_id)
    }

    /// Which root `dir` lives under, if any
    pub fn root_of(&self, dir: &Path) -> Option<RootKind> {
        RootKind::ALL
            .into_iter()
            .find(|kind| dir.starts_with(self.root_dir(*kind)))
    }

    /// Create any missing root directories
    pub async fn ensure_roots(&self) -> PluginResult<()> {
        for kind in RootKind::ALL {
            tokio::fs::create_dir_all(self.root_dir(kind)).await?;
        }
        Ok(())
    }

    /// Scan all roots in priority order; never fails wholesale
    pub async fn scan_for_plugins(&self) -> Vec<DiscoveredPlugin> {
        let mut found = Vec::new();
        for kind in RootKind::ALL {
            found.extend(self.scan_root(kind).await);
        }
        info!(count = found.len(), "Scanned plugin directories");
        found
    }

    async fn scan_root(&self, kind: RootKind) -> Vec<DiscoveredPlugin> {
        let root = self.root_dir(kind);
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Failed to read plugin root");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "Plugin root scan interrupted");
                    break;
                }
            };

            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let directory = entry.path();
            if !is_dir || !tokio::fs::try_exists(directory.join(MANIFEST_FILE)).await.unwrap_or(false) {
                continue;
            }

            match self.read_manifest(&directory).await {
                Ok(manifest) => {
                    let dir_name = entry.file_name();
                    if dir_name.to_str() != Some(manifest.id.as_str()) {
                        warn!(
                            plugin_id = %manifest.id,
                            directory = %directory.display(),
                            "Plugin directory name does not match manifest id"
                        );
                    }
                    found.push(DiscoveredPlugin {
                        manifest,
                        directory,
                        root: kind,
                    });
                }
                Err(e) => {
                    warn!(directory = %directory.display(), error = %e, "Skipping invalid plugin");
                }
            }
        }

        debug!(root = %kind, count = found.len(), "Scanned plugin root");
        found
    }

    /// Parse and validate the manifest in `dir`, caching it by id
    pub async fn read_manifest(&self, dir: &Path) -> PluginResult<Manifest> {
        let path = dir.join(MANIFEST_FILE);
        let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PluginError::ManifestValidation(format!("Cannot read {}: {e}", path.display()))
        })?;
        let manifest = manifest::parse_str(&data)?;
        manifest::validate(&manifest, dir)?;

        self.manifests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(manifest.id.clone(), manifest.clone());
        Ok(manifest)
    }

    pub fn cached_manifest(&self, plugin_id: &str) -> Option<Manifest> {
        self.manifests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .cloned()
    }

    /// Forget one cached manifest, or all of them
    pub fn clear_cache(&self, plugin_id: Option<&str>) {
        let mut manifests = self.manifests.write().unwrap_or_else(|e| e.into_inner());
        match plugin_id {
            Some(id) => {
                manifests.remove(id);
            }
            None => manifests.clear(),
        }
    }

    /// Copy `source` into `<root>/<target_id>`, returning the target path
    ///
    /// The target must not exist yet. A failed copy removes whatever was
    /// written so no partial plugin is left for the next scan.
    pub async fn install_plugin_files(
        &self,
        source: &Path,
        target_id: &str,
        kind: RootKind,
    ) -> PluginResult<PathBuf> {
        self.install_files_with(source, target_id, kind, copy_dir_recursive)
            .await
    }

    async fn install_files_with(
        &self,
        source: &Path,
        target_id: &str,
        kind: RootKind,
        copy: fn(&Path, &Path) -> std::io::Result<()>,
    ) -> PluginResult<PathBuf> {
        let target = self.plugin_dir(target_id, kind);
        let source = tokio::fs::canonicalize(source).await.map_err(|e| {
            PluginError::loader(target_id, format!("source {}: {e}", source.display()))
        })?;
        tokio::fs::create_dir_all(self.root_dir(kind)).await?;

        if target.starts_with(&source) {
            return Err(PluginError::loader(
                target_id,
                "cannot install a plugin into its own source directory",
            ));
        }
        if tokio::fs::try_exists(&target).await? {
            return Err(PluginError::loader(
                target_id,
                format!("target directory already exists: {}", target.display()),
            ));
        }

        let (from, to) = (source.clone(), target.clone());
        let copied = match tokio::task::spawn_blocking(move || copy(&from, &to)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PluginError::loader(target_id, format!("failed to copy files: {e}"))),
            Err(e) => Err(PluginError::loader(target_id, format!("copy task failed: {e}"))),
        };

        if let Err(e) = copied {
            if let Err(cleanup) = self.remove_plugin_dir(target_id, &target).await {
                warn!(plugin_id = target_id, error = %cleanup, "Failed to remove partially copied plugin");
            }
            return Err(e);
        }

        info!(plugin_id = target_id, from = %source.display(), to = %target.display(), "Installed plugin files");
        Ok(target)
    }

    /// Remove `<root>/<plugin_id>`; an absent directory is success
    pub async fn uninstall_plugin_files(&self, plugin_id: &str, kind: RootKind) -> PluginResult<()> {
        let target = self.plugin_dir(plugin_id, kind);
        self.remove_plugin_dir(plugin_id, &target).await
    }

    pub async fn remove_plugin_dir(&self, plugin_id: &str, dir: &Path) -> PluginResult<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                info!(plugin_id, directory = %dir.display(), "Removed plugin files");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PluginError::loader(plugin_id, format!("failed to remove files: {e}"))),
        }
    }

    /// Entry path for `manifest` inside `dir`; must exist
    pub fn resolve_entry_file(&self, dir: &Path, manifest: &Manifest) -> PluginResult<PathBuf> {
        let mut entry = manifest
            .main
            .clone()
            .unwrap_or_else(|| DEFAULT_ENTRY.to_string());
        if !ENTRY_EXTENSIONS.iter().any(|ext| entry.ends_with(ext)) {
            entry.push_str(".wasm");
        }

        let path = resolve_contained(dir, &entry).ok_or_else(|| {
            PluginError::loader(&manifest.id, format!("entry '{entry}' escapes the plugin directory"))
        })?;
        if !path.is_file() {
            return Err(PluginError::loader(
                &manifest.id,
                format!("entry file not found: {entry}"),
            ));
        }
        Ok(path)
    }

    /// Load the plugin's entry module with `api` as its capability surface
    ///
    /// Both runtimes require the module to export at least one item.
    pub fn load_plugin_module(
        &self,
        dir: &Path,
        manifest: &Manifest,
        api: Option<Arc<dyn HostApi>>,
    ) -> PluginResult<PluginModule> {
        let entry = self.resolve_entry_file(dir, manifest)?;
        let api = api.unwrap_or_else(|| Arc::new(EmptyHostApi));
        let plugin_id = manifest.id.as_str();

        let (exports, runtime) = match &self.sandbox {
            Some(sandbox) => (
                sandbox.load_plugin_module(plugin_id, &entry, api)?,
                RuntimeKind::Sandboxed,
            ),
            None => (self.direct.load(plugin_id, &entry, api)?, RuntimeKind::Direct),
        };

        let module = PluginModule {
            plugin_id: plugin_id.to_string(),
            entry,
            exports,
            runtime,
        };

        if module.exports.is_empty() {
            self.release_module(&module);
            return Err(PluginError::loader(
                plugin_id,
                "plugin module must export at least one item",
            ));
        }

        Ok(module)
    }

    pub fn invoke(&self, module: &PluginModule, export: &str) -> PluginResult<Option<i32>> {
        match (module.runtime, &self.sandbox) {
            (RuntimeKind::Sandboxed, Some(sandbox)) => Ok(sandbox.invoke(&module.plugin_id, export)?),
            (RuntimeKind::Sandboxed, None) => Err(PluginError::loader(
                &module.plugin_id,
                "module was loaded by a sandbox that no longer exists",
            )),
            (RuntimeKind::Direct, _) => self.direct.invoke(&module.plugin_id, export),
        }
    }

    /// Run an optional lifecycle hook; returns whether it was exported
    ///
    /// A non-zero i32 result is a failure.
    pub fn call_hook(&self, module: &PluginModule, hook: &str) -> PluginResult<bool> {
        if !module.has_export(hook) {
            return Ok(false);
        }

        match self.invoke(module, hook)? {
            Some(code) if code != 0 => Err(PluginError::loader(
                &module.plugin_id,
                format!("{hook} returned status {code}"),
            )),
            _ => Ok(true),
        }
    }

    pub fn release_module(&self, module: &PluginModule) {
        let released = match (module.runtime, &self.sandbox) {
            (RuntimeKind::Sandboxed, Some(sandbox)) => sandbox.destroy_context(&module.plugin_id),
            (RuntimeKind::Sandboxed, None) => false,
            (RuntimeKind::Direct, _) => self.direct.release(&module.plugin_id),
        };
        debug!(plugin_id = %module.plugin_id, released, "Released plugin module");
    }

    pub async fn load_plugin_config(&self, dir: &Path) -> RuntimeConfig {
        runtime_config::load(dir).await
    }

    pub async fn save_plugin_config(&self, dir: &Path, config: &mut RuntimeConfig) -> PluginResult<()> {
        runtime_config::save(dir, config).await
    }
}

/// Recursive copy; symlinks are skipped
fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            warn!(path = %entry.path().display(), "Skipping non-regular file while copying plugin");
        }
    }
    Ok(())
}
