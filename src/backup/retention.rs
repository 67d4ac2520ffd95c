use super::{list_snapshot_entries, SnapshotEntry};
use crate::catalog::BackupClass;
use crate::config::RetentionPolicy;
use crate::error::{BackupError, Result};
use std::path::PathBuf;
use tokio::fs;
use tracing::{error, info};

#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    pub keep: Vec<SnapshotEntry>,
    pub remove: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    pub kept: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    /// Directories that could not be removed, with the reason
    pub failed: Vec<(PathBuf, String)>,
}

/// Keeps the newest N snapshot directories per class.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    root: PathBuf,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(root: impl Into<PathBuf>, policy: RetentionPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    /// Partition `entries` without touching the filesystem.
    ///
    /// Newest first by modification time, ties broken by name. At least one
    /// snapshot is always kept, even with a zero keep count.
    pub fn plan(&self, class: BackupClass, entries: &[SnapshotEntry]) -> RetentionPlan {
        let prefix = class.dir_prefix();
        let mut candidates: Vec<SnapshotEntry> = entries
            .iter()
            .filter(|e| e.is_dir && e.name.starts_with(&prefix))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));

        let keep_count = self.policy.keep_count(class).max(1).min(candidates.len());
        let remove = candidates.split_off(keep_count);
        RetentionPlan {
            keep: candidates,
            remove,
        }
    }

    /// Delete everything past the keep count. A failed deletion is logged
    /// and the loop carries on with the next directory.
    pub async fn enforce(&self, class: BackupClass, entries: &[SnapshotEntry]) -> RetentionReport {
        let plan = self.plan(class, entries);
        let mut report = RetentionReport {
            kept: plan.keep.iter().map(|e| e.path.clone()).collect(),
            ..RetentionReport::default()
        };

        for entry in plan.remove {
            match fs::remove_dir_all(&entry.path).await {
                Ok(()) => {
                    info!("Removed expired {} snapshot {}", class, entry.name);
                    report.deleted.push(entry.path);
                }
                // Already gone, e.g. an interrupted earlier pass.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    report.deleted.push(entry.path);
                }
                Err(source) => {
                    let err = BackupError::RetentionCleanup {
                        path: entry.path.clone(),
                        source,
                    };
                    error!("{}", err);
                    report.failed.push((entry.path, err.to_string()));
                }
            }
        }

        info!(
            "Retention for {} backups: kept {}, deleted {}, failed {}",
            class,
            report.kept.len(),
            report.deleted.len(),
            report.failed.len()
        );
        report
    }

    pub async fn enforce_in_root(&self, class: BackupClass) -> Result<RetentionReport> {
        let entries = list_snapshot_entries(&self.root).await?;
        Ok(self.enforce(class, &entries).await)
    }

    pub async fn plan_in_root(&self, class: BackupClass) -> Result<RetentionPlan> {
        let entries = list_snapshot_entries(&self.root).await?;
        Ok(self.plan(class, &entries))
    }
}
