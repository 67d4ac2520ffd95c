use super::TableSnapshot;
use crate::catalog::BackupClass;
use crate::error::{BackupError, Result};
use crate::store::{read_table, RowStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Written {
        table: String,
        path: PathBuf,
        record_count: usize,
    },
    SkippedMissing {
        table: String,
    },
}

impl SnapshotOutcome {
    pub fn table(&self) -> &str {
        match self {
            SnapshotOutcome::Written { table, .. } | SnapshotOutcome::SkippedMissing { table } => {
                table
            }
        }
    }
}

/// Exports a single table to `<table>.json`.
///
/// The table name is not checked against the catalog; callers decide what
/// to snapshot.
pub struct TableSnapshotter {
    store: Arc<dyn RowStore>,
    page_size: usize,
}

impl TableSnapshotter {
    pub fn new(store: Arc<dyn RowStore>, page_size: usize) -> Self {
        Self { store, page_size }
    }

    pub async fn snapshot(
        &self,
        table: &str,
        target_dir: &Path,
        class: BackupClass,
    ) -> Result<SnapshotOutcome> {
        let rows = match read_table(self.store.as_ref(), table, self.page_size).await {
            Ok(rows) => rows,
            Err(BackupError::TableNotFound { .. }) if !class.missing_table_is_fatal() => {
                warn!("Table {} does not exist, skipping it in this {} backup", table, class);
                return Ok(SnapshotOutcome::SkippedMissing {
                    table: table.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let snapshot = TableSnapshot::new(table, rows);
        let path = snapshot.write_to(target_dir).await?;
        info!("Exported {} rows from {}", snapshot.record_count, table);

        Ok(SnapshotOutcome::Written {
            table: table.to_string(),
            path,
            record_count: snapshot.record_count,
        })
    }
}
