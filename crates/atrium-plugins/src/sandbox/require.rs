//! Import gate for sandboxed modules
//!
//! Every import namespace a module declares is checked here before the
//! module is linked. Names on the denylist are refused unless a caller
//! allowlists them for one particular load.

use crate::error::{SandboxError, SandboxResult};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

/// Namespaces refused by default: process, filesystem, network and
/// native-system surfaces
pub const DEFAULT_FORBIDDEN: &[&str] = &[
    "process",
    "child_process",
    "cluster",
    "worker_threads",
    "fs",
    "net",
    "http",
    "https",
    "http2",
    "dns",
    "tls",
    "dgram",
    "os",
    "vm",
    "v8",
    "wasi_snapshot_preview1",
    "wasi_unstable",
    "wasi:cli",
    "wasi:filesystem",
    "wasi:sockets",
    "wasi:http",
];

/// Runtime-editable set of forbidden import namespaces
#[derive(Debug, Clone)]
pub struct ModuleDenylist {
    forbidden: Arc<RwLock<BTreeSet<String>>>,
}

impl Default for ModuleDenylist {
    fn default() -> Self {
        Self {
            forbidden: Arc::new(RwLock::new(
                DEFAULT_FORBIDDEN.iter().map(|m| m.to_string()).collect(),
            )),
        }
    }
}

impl ModuleDenylist {
    pub fn is_forbidden(&self, module: &str) -> bool {
        let name = base_name(module);
        self.forbidden
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Remove `module` from the denylist; returns true if it was present
    pub fn allow(&self, module: &str) -> bool {
        self.forbidden
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(base_name(module))
    }

    /// Add `module` to the denylist; returns true if it was newly added
    pub fn forbid(&self, module: &str) -> bool {
        self.forbidden
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(base_name(module).to_string())
    }

    fn snapshot(&self) -> BTreeSet<String> {
        self.forbidden
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Import checker bound to one plugin and one load
#[derive(Debug, Clone)]
pub struct SafeRequire {
    plugin_id: String,
    forbidden: BTreeSet<String>,
    allowed: HashSet<String>,
}

impl SafeRequire {
    pub(crate) fn new(plugin_id: &str, denylist: &ModuleDenylist, extra_allowed: &[&str]) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            forbidden: denylist.snapshot(),
            allowed: extra_allowed
                .iter()
                .map(|m| base_name(m).to_string())
                .collect(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Fail with [`SandboxError::ForbiddenModule`] for a denylisted namespace
    pub fn check(&self, module: &str) -> SandboxResult<()> {
        let name = base_name(module);
        if self.forbidden.contains(name) && !self.allowed.contains(name) {
            return Err(SandboxError::ForbiddenModule {
                plugin_id: self.plugin_id.clone(),
                module: module.to_string(),
            });
        }
        Ok(())
    }
}

/// `wasi:filesystem/types@0.2.0` and `node:fs` both reduce to their base
fn base_name(module: &str) -> &str {
    let module = module.strip_prefix("node:").unwrap_or(module);
    module.split(['/', '@']).next().unwrap_or(module)
}
