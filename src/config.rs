use std::path::PathBuf;

use crate::disk_error::DiskFailurePolicy;

/// Configuration for a table's live-data tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Root data directory. Table directories live at `<data>/<ks>/<cf>-<id>/`.
    pub data_dir: PathBuf,

    /// What to do when a disk fault is reported (default: best_effort)
    pub disk_failure_policy: DiskFailurePolicy,

    /// Hard-link newly added sstables into `backups/` (default: false)
    pub incremental_backups: bool,

    /// Floor for the geometric split-writer schedule (default: 50MB)
    pub smallest_split_sstable_bytes: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            disk_failure_policy: DiskFailurePolicy::BestEffort,
            incremental_backups: false,
            smallest_split_sstable_bytes: 50_000_000,
        }
    }
}

impl TrackerConfig {
    /// Create a new config rooted at the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the disk failure policy
    pub fn disk_failure_policy(mut self, policy: DiskFailurePolicy) -> Self {
        self.disk_failure_policy = policy;
        self
    }

    /// Enable incremental backups
    pub fn incremental_backups(mut self, enabled: bool) -> Self {
        self.incremental_backups = enabled;
        self
    }

    /// Set the split-writer size floor
    pub fn smallest_split_sstable_bytes(mut self, bytes: u64) -> Self {
        self.smallest_split_sstable_bytes = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.disk_failure_policy, DiskFailurePolicy::BestEffort);
        assert!(!config.incremental_backups);
        assert_eq!(config.smallest_split_sstable_bytes, 50_000_000);
    }

    #[test]
    fn test_config_builder() {
        let config = TrackerConfig::new("/tmp/test")
            .disk_failure_policy(DiskFailurePolicy::Die)
            .incremental_backups(true)
            .smallest_split_sstable_bytes(1024);

        assert_eq!(config.data_dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.disk_failure_policy, DiskFailurePolicy::Die);
        assert!(config.incremental_backups);
        assert_eq!(config.smallest_split_sstable_bytes, 1024);
    }
}
