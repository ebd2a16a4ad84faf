//! Landlock filesystem sandboxing

use crate::{Result, StockadeError};
use landlock::{
    ABI, Access, AccessFs, Ruleset, RulesetAttr, RulesetCreated, RulesetCreatedAttr,
    path_beneath_rules,
};
use std::path::PathBuf;

const TARGET_ABI: ABI = ABI::V2;

/// Filesystem allow-list. Empty means unrestricted.
#[derive(Debug, Clone, Default)]
pub struct LandlockConfig {
    /// Paths with read and execute access
    pub ro_paths: Vec<PathBuf>,
    /// Paths with full access
    pub rw_paths: Vec<PathBuf>,
}

impl LandlockConfig {
    /// Add a read-only path
    #[must_use]
    pub fn ro(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if !self.ro_paths.contains(&path) {
            self.ro_paths.push(path);
        }
        self
    }

    /// Add a read-write path
    #[must_use]
    pub fn rw(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if !self.rw_paths.contains(&path) {
            self.rw_paths.push(path);
        }
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ro_paths.is_empty() && self.rw_paths.is_empty()
    }

    /// Build the ruleset. The forked child only has to call
    /// `restrict_self` on it.
    pub fn prepare(&self) -> Result<Option<RulesetCreated>> {
        if self.is_empty() {
            return Ok(None);
        }

        let existing = |paths: &[PathBuf]| -> Vec<PathBuf> {
            paths
                .iter()
                .filter(|p| {
                    let exists = p.exists();
                    if !exists {
                        tracing::warn!(path = %p.display(), "allow-listed path does not exist");
                    }
                    exists
                })
                .cloned()
                .collect()
        };
        let ro = existing(&self.ro_paths);
        let rw = existing(&self.rw_paths);

        let ruleset = Ruleset::default()
            .handle_access(AccessFs::from_all(TARGET_ABI))
            .and_then(Ruleset::create)
            .and_then(|r| r.add_rules(path_beneath_rules(&ro, AccessFs::from_read(TARGET_ABI))))
            .and_then(|r| r.add_rules(path_beneath_rules(&rw, AccessFs::from_all(TARGET_ABI))))
            .map_err(|e| StockadeError::Landlock(format!("failed to build ruleset: {e}")))?;

        tracing::debug!(ro = ro.len(), rw = rw.len(), "landlock ruleset prepared");
        Ok(Some(ruleset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_prepares_nothing() {
        assert!(LandlockConfig::default().prepare().unwrap().is_none());
    }

    #[test]
    fn duplicate_paths_are_collapsed() {
        let cfg = LandlockConfig::default().ro("/usr").ro("/usr").rw("/tmp");
        assert_eq!(cfg.ro_paths.len(), 1);
        assert!(!cfg.is_empty());
    }

    #[test]
    fn missing_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LandlockConfig::default()
            .ro(dir.path())
            .ro(dir.path().join("missing"));
        assert!(cfg.prepare().is_ok());
    }
}
