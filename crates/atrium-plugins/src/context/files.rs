//! File access confined to the plugin's install directory

use crate::error::{PluginError, PluginResult};
use crate::permission::{Permission, PermissionSet};
use crate::services::{FileService, FileStat};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Resolve `relative` against `base` and return it only if it stays inside
///
/// Resolution is lexical: `.` and `..` are folded without touching the
/// filesystem, and an absolute `relative` is accepted only when it already
/// lies under `base`. Symlinks inside the plugin directory are not followed.
pub(crate) fn resolve_contained(base: &Path, relative: &str) -> Option<PathBuf> {
    let base = normalize(base);
    let resolved = normalize(&base.join(relative));
    resolved.starts_with(&base).then_some(resolved)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Clone)]
pub struct FileApi {
    plugin_id: String,
    install_path: PathBuf,
    permissions: PermissionSet,
    service: Arc<dyn FileService>,
}

impl FileApi {
    pub(crate) fn new(
        plugin_id: &str,
        install_path: &Path,
        permissions: PermissionSet,
        service: Arc<dyn FileService>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            install_path: install_path.to_path_buf(),
            permissions,
            service,
        }
    }

    pub fn read(&self, path: &str) -> PluginResult<String> {
        self.permissions.require(&self.plugin_id, Permission::FilesOpen)?;
        let resolved = self.resolve(path)?;
        self.service
            .read(&resolved)
            .map_err(|e| self.failure("read", path, e))
    }

    pub fn write(&self, path: &str, content: &str) -> PluginResult<()> {
        self.permissions.require(&self.plugin_id, Permission::FilesSave)?;
        let resolved = self.resolve(path)?;
        self.service
            .write(&resolved, content)
            .map_err(|e| self.failure("write", path, e))
    }

    pub fn exists(&self, path: &str) -> PluginResult<bool> {
        self.permissions.require(&self.plugin_id, Permission::FilesOpen)?;
        let resolved = self.resolve(path)?;
        Ok(self.service.exists(&resolved))
    }

    pub fn stat(&self, path: &str) -> PluginResult<FileStat> {
        self.permissions.require(&self.plugin_id, Permission::FilesOpen)?;
        let resolved = self.resolve(path)?;
        self.service
            .stat(&resolved)
            .map_err(|e| self.failure("stat", path, e))
    }

    fn resolve(&self, path: &str) -> PluginResult<PathBuf> {
        resolve_contained(&self.install_path, path).ok_or_else(|| {
            warn!(plugin_id = %self.plugin_id, path, "Plugin file access outside install directory");
            PluginError::PathEscape {
                plugin_id: self.plugin_id.clone(),
                path: path.to_string(),
            }
        })
    }

    fn failure(&self, op: &str, path: &str, e: std::io::Error) -> PluginError {
        warn!(plugin_id = %self.plugin_id, op, path, error = %e, "Plugin file operation failed");
        PluginError::service("File", format!("{op} '{path}': {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::LocalFileService;

    fn api(dir: &Path, granted: &[Permission]) -> FileApi {
        FileApi::new(
            "notes",
            dir,
            PermissionSet::new(granted.iter().copied()),
            Arc::new(LocalFileService),
        )
    }

    #[test]
    fn test_resolve_contained() {
        let base = Path::new("/plugins/user/notes");
        assert_eq!(
            resolve_contained(base, "data/a.txt"),
            Some(PathBuf::from("/plugins/user/notes/data/a.txt"))
        );
        assert_eq!(
            resolve_contained(base, "./data/../b.txt"),
            Some(PathBuf::from("/plugins/user/notes/b.txt"))
        );
        assert!(resolve_contained(base, "../../etc/passwd").is_none());
        assert!(resolve_contained(base, "/etc/passwd").is_none());
        assert!(resolve_contained(base, "../notes-evil/x").is_none());
        assert!(resolve_contained(base, "/plugins/user/notes/icon.png").is_some());
    }

    #[test]
    fn test_traversal_fails_with_every_permission() {
        let tmp = tempfile::tempdir().unwrap();
        let files = api(tmp.path(), &[Permission::FilesOpen, Permission::FilesSave]);

        let err = files.read("../../etc/passwd").unwrap_err();
        assert!(matches!(err, PluginError::PathEscape { .. }));
        assert!(files.write("../outside.txt", "x").is_err());
        assert!(!tmp.path().parent().unwrap().join("outside.txt").exists());
    }

    #[test]
    fn test_read_write_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let files = api(tmp.path(), &[Permission::FilesOpen, Permission::FilesSave]);

        files.write("data/notes.txt", "hello").unwrap();
        assert_eq!(files.read("data/notes.txt").unwrap(), "hello");
        assert!(files.exists("data/notes.txt").unwrap());
        assert!(!files.exists("missing.txt").unwrap());
        let stat = files.stat("data/notes.txt").unwrap();
        assert_eq!(stat.size, 5);
        assert!(stat.is_file);
    }

    #[test]
    fn test_each_operation_checks_its_permission() {
        let tmp = tempfile::tempdir().unwrap();
        let files = api(tmp.path(), &[Permission::FilesOpen]);

        let err = files.write("a.txt", "x").unwrap_err();
        assert!(matches!(
            err,
            PluginError::PermissionDenied { permission: Permission::FilesSave, .. }
        ));
        assert!(files.exists("a.txt").is_ok());
    }

    #[test]
    fn test_read_failure_is_a_service_error() {
        let tmp = tempfile::tempdir().unwrap();
        let files = api(tmp.path(), &[Permission::FilesOpen]);
        let err = files.read("missing.txt").unwrap_err();
        assert_eq!(err.code(), "E563");
    }
}
