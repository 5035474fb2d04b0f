//! Git-based plugin acquisition
//!
//! The lifecycle manager uses this to install plugins from repository URLs
//! and to check installed plugins for upstream changes. It is never exposed
//! to plugin code.

use crate::error::{PluginError, PluginResult};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

static GIT_URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(https?://|git@|git://|ssh://)").expect("valid git url pattern"));

/// Prefix of temporary clone directories
pub const TEMP_DIR_PREFIX: &str = "plugin-git-";

/// True if `source` looks like a remote repository rather than a local path
pub fn is_git_url(source: &str) -> bool {
    GIT_URL_PATTERN.is_match(source.trim())
}

pub fn is_git_repository(path: &Path) -> bool {
    path.join(".git").exists()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    pub url: Option<String>,
    pub branch: Option<String>,
    pub commit: String,
}

impl RepositoryInfo {
    pub fn short_commit(&self) -> &str {
        self.commit.get(..8).unwrap_or(&self.commit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub has_updates: bool,
    pub local_commit: String,
    pub remote_commit: String,
}

/// Source-control operations needed by the lifecycle manager
#[async_trait]
pub trait GitService: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Clone `url` at depth 1 into `target`
    async fn clone_shallow(&self, url: &str, target: &Path) -> PluginResult<RepositoryInfo>;

    /// Fetch and compare the local head with its upstream
    async fn check_for_updates(&self, repo: &Path) -> PluginResult<UpdateStatus>;

    /// Fast-forward to upstream; returns true if anything changed
    async fn pull(&self, repo: &Path) -> PluginResult<bool>;

    async fn repository_info(&self, repo: &Path) -> PluginResult<RepositoryInfo>;

    async fn create_temp_dir(&self) -> PluginResult<PathBuf> {
        let dir = std::env::temp_dir().join(format!("{TEMP_DIR_PREFIX}{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn cleanup_temp_dir(&self, dir: &Path) -> PluginResult<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// [`GitService`] backed by libgit2
#[derive(Debug, Clone, Copy, Default)]
pub struct Git2Service;

#[async_trait]
impl GitService for Git2Service {
    async fn is_available(&self) -> bool {
        let version = git2::Version::get();
        version.https() || version.ssh()
    }

    async fn clone_shallow(&self, url: &str, target: &Path) -> PluginResult<RepositoryInfo> {
        let url = url.to_string();
        let target = target.to_path_buf();
        blocking(move || {
            info!(url = %url, target = %target.display(), "Cloning plugin repository");
            let mut fetch = git2::FetchOptions::new();
            fetch.depth(1);
            let repo = git2::build::RepoBuilder::new()
                .fetch_options(fetch)
                .clone(&url, &target)?;
            read_info(&repo)
        })
        .await
    }

    async fn check_for_updates(&self, repo: &Path) -> PluginResult<UpdateStatus> {
        let path = repo.to_path_buf();
        blocking(move || {
            let repo = git2::Repository::open(&path)?;
            let (local, remote) = fetch_upstream(&repo)?;
            debug!(repo = %path.display(), %local, %remote, "Compared plugin repository with upstream");
            Ok(UpdateStatus {
                has_updates: local != remote && !is_descendant(&repo, local, remote),
                local_commit: local.to_string(),
                remote_commit: remote.to_string(),
            })
        })
        .await
    }

    async fn pull(&self, repo: &Path) -> PluginResult<bool> {
        let path = repo.to_path_buf();
        blocking(move || {
            let repo = git2::Repository::open(&path)?;
            let (_, remote) = fetch_upstream(&repo)?;
            let upstream = repo.find_annotated_commit(remote)?;
            let (analysis, _) = repo.merge_analysis(&[&upstream])?;

            if analysis.is_up_to_date() {
                return Ok(false);
            }
            if !analysis.is_fast_forward() {
                return Err(PluginError::Git(format!(
                    "{} has diverged from upstream and cannot be fast-forwarded",
                    path.display()
                )));
            }

            let head = repo.head()?;
            let refname = head
                .name()
                .ok_or_else(|| PluginError::Git("HEAD is not a named reference".to_string()))?
                .to_string();
            let mut reference = repo.find_reference(&refname)?;
            reference.set_target(remote, "atrium: fast-forward plugin")?;
            repo.set_head(&refname)?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;

            info!(repo = %path.display(), commit = %remote, "Fast-forwarded plugin repository");
            Ok(true)
        })
        .await
    }

    async fn repository_info(&self, repo: &Path) -> PluginResult<RepositoryInfo> {
        let path = repo.to_path_buf();
        blocking(move || read_info(&git2::Repository::open(&path)?)).await
    }
}

impl From<git2::Error> for PluginError {
    fn from(e: git2::Error) -> Self {
        PluginError::Git(e.message().to_string())
    }
}

async fn blocking<T, F>(f: F) -> PluginResult<T>
where
    F: FnOnce() -> PluginResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PluginError::Git(format!("git task failed: {e}")))?
}

fn read_info(repo: &git2::Repository) -> PluginResult<RepositoryInfo> {
    let head = repo.head()?;
    let commit = head.peel_to_commit()?.id().to_string();
    let branch = head.shorthand().map(str::to_string);
    let url = repo
        .find_remote("origin")
        .ok()
        .and_then(|remote| remote.url().map(str::to_string));
    Ok(RepositoryInfo {
        url,
        branch,
        commit,
    })
}

/// Fetch the current branch from origin; returns (local, upstream) commit ids
fn fetch_upstream(repo: &git2::Repository) -> PluginResult<(git2::Oid, git2::Oid)> {
    let head = repo.head()?;
    let branch = head
        .shorthand()
        .ok_or_else(|| PluginError::Git("HEAD is detached".to_string()))?
        .to_string();
    let local = head.peel_to_commit()?.id();

    let tracking = format!("refs/remotes/origin/{branch}");
    let refspec = format!("+refs/heads/{branch}:{tracking}");
    let mut remote = repo.find_remote("origin")?;
    let mut fetch = git2::FetchOptions::new();
    fetch.depth(1);
    remote.fetch(&[refspec.as_str()], Some(&mut fetch), None)?;

    let upstream = repo.refname_to_id(&tracking)?;
    Ok((local, upstream))
}

/// Local commits ahead of upstream are not updates
fn is_descendant(repo: &git2::Repository, local: git2::Oid, remote: git2::Oid) -> bool {
    match repo.graph_descendant_of(local, remote) {
        Ok(descendant) => descendant,
        Err(e) => {
            warn!(error = %e, "Could not compare commit ancestry");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_url_detection() {
        assert!(is_git_url("https://example.com/repo.git"));
        assert!(is_git_url("http://example.com/repo"));
        assert!(is_git_url("git@github.com:org/repo.git"));
        assert!(is_git_url("git://example.com/repo.git"));
        assert!(is_git_url("ssh://git@example.com/repo.git"));
        assert!(!is_git_url("/home/user/plugins/demo"));
        assert!(!is_git_url("./demo"));
        assert!(!is_git_url("ftp://example.com/repo"));
    }

    #[test]
    fn test_short_commit() {
        let info = RepositoryInfo {
            url: None,
            branch: Some("main".into()),
            commit: "0123456789abcdef".into(),
        };
        assert_eq!(info.short_commit(), "01234567");
    }

    #[tokio::test]
    async fn test_temp_dir_lifecycle() {
        let git = Git2Service;
        let dir = git.create_temp_dir().await.expect("create");
        assert!(dir.exists());
        assert!(
            dir.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(TEMP_DIR_PREFIX))
        );

        git.cleanup_temp_dir(&dir).await.expect("cleanup");
        assert!(!dir.exists());
        git.cleanup_temp_dir(&dir).await.expect("cleanup is idempotent");
    }

    #[test]
    fn test_is_git_repository() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_git_repository(tmp.path()));
        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        assert!(is_git_repository(tmp.path()));
    }
}
