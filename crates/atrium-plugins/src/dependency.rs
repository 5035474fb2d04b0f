//! Dependency and conflict resolution against the installed plugin set

use crate::error::{PluginError, PluginResult};
use crate::manifest::{DependencySpec, Manifest};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Outcome of checking a manifest's required dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub missing: Vec<DependencySpec>,
    pub incompatible: Vec<DependencySpec>,
}

impl DependencyReport {
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty() && self.incompatible.is_empty()
    }

    /// Convert an unsatisfied report into a [`PluginError::Dependency`]
    pub fn into_result(self, plugin_id: &str) -> PluginResult<()> {
        if self.is_satisfied() {
            return Ok(());
        }

        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            let ids: Vec<_> = self.missing.iter().map(|d| d.plugin_id.as_str()).collect();
            parts.push(format!("missing {}", ids.join(", ")));
        }
        if !self.incompatible.is_empty() {
            let ids: Vec<_> = self
                .incompatible
                .iter()
                .map(|d| format!("{} ({})", d.plugin_id, d.version))
                .collect();
            parts.push(format!("incompatible {}", ids.join(", ")));
        }

        Err(PluginError::Dependency {
            plugin_id: plugin_id.to_string(),
            reason: parts.join("; "),
        })
    }
}

/// Check required dependencies of `manifest` against `installed`
///
/// Optional dependencies are never reported.
pub fn check_dependencies(
    manifest: &Manifest,
    installed: &HashMap<String, Manifest>,
) -> DependencyReport {
    let mut report = DependencyReport::default();

    for dep in manifest.dependencies.iter().filter(|d| !d.optional) {
        match installed.get(&dep.plugin_id) {
            None => report.missing.push(dep.clone()),
            Some(target) if !version_satisfies(&target.version, &dep.version) => {
                report.incompatible.push(dep.clone())
            }
            Some(_) => {}
        }
    }

    report
}

/// Human-readable reasons why `manifest` cannot join the installed set
///
/// A conflict declared by either side blocks installation.
pub fn check_conflicts(manifest: &Manifest, installed: &HashMap<String, Manifest>) -> Vec<String> {
    let mut reasons = Vec::new();

    if installed.contains_key(&manifest.id) {
        reasons.push(format!("Plugin '{}' is already installed", manifest.id));
    }

    for conflict in &manifest.conflicts {
        if installed.contains_key(conflict) {
            reasons.push(format!(
                "Plugin '{}' declares a conflict with installed plugin '{conflict}'",
                manifest.id
            ));
        }
    }

    let mut blockers: Vec<_> = installed
        .values()
        .filter(|other| other.id != manifest.id && other.declares_conflict_with(&manifest.id))
        .map(|other| other.id.as_str())
        .collect();
    blockers.sort_unstable();
    for blocker in blockers {
        reasons.push(format!(
            "Installed plugin '{blocker}' declares a conflict with '{}'",
            manifest.id
        ));
    }

    reasons
}

/// Evaluate a version requirement
///
/// Supported forms: `*`, `>=x.y.z`, `~x.y`, `^x`, and an exact version.
pub fn version_satisfies(actual: &str, required: &str) -> bool {
    let required = required.trim();

    if required == "*" {
        return true;
    }

    if let Some(min) = required.strip_prefix(">=") {
        return compare_versions(actual, min.trim()) != Ordering::Less;
    }

    if let Some(range) = required.strip_prefix('~') {
        let want = numeric_parts(range);
        let have = numeric_parts(actual);
        return have.first() == want.first() && component(&have, 1) == component(&want, 1);
    }

    if let Some(range) = required.strip_prefix('^') {
        return numeric_parts(actual).first() == numeric_parts(range).first();
    }

    actual == required
}

/// Compare dotted versions component by component, missing parts as zero
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = numeric_parts(a);
    let right = numeric_parts(b);
    let len = left.len().max(right.len());

    (0..len)
        .map(|i| component(&left, i).cmp(&component(&right, i)))
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn numeric_parts(version: &str) -> Vec<u64> {
    let core = version
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    core.split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

fn component(parts: &[u64], index: usize) -> u64 {
    parts.get(index).copied().unwrap_or(0)
}
