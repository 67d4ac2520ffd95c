use super::{
    create_unique_dir, path_safe_timestamp, DumpFile, Metadata, RetentionManager,
    RetentionReport, SnapshotOutcome, TableListRecord, TableSnapshot, TableSnapshotter,
    CAPTURE_METHOD, FORMAT_VERSION, SAFETY_PREFIX, SNAPSHOT_EXTENSION,
};
use crate::catalog::BackupClass;
use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::store::{read_table, RowStore};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

const CONSISTENCY_NOTE: &str =
    "Tables were exported one after another; this is not a transactional snapshot.";

/// Result of a successful snapshot run.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub class: BackupClass,
    pub directory: PathBuf,
    pub metadata: Metadata,
    pub outcomes: Vec<SnapshotOutcome>,
    /// `None` when retention could not even list the backup root
    pub retention: Option<RetentionReport>,
}

impl BackupRun {
    pub fn total_rows(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o {
                SnapshotOutcome::Written { record_count, .. } => *record_count,
                SnapshotOutcome::SkippedMissing { .. } => 0,
            })
            .sum()
    }
}

/// Produces one timestamped snapshot directory per run.
pub struct SnapshotDirectoryBuilder {
    config: Arc<Config>,
    store: Arc<dyn RowStore>,
}

struct Capture<'a> {
    base_name: String,
    class: BackupClass,
    tables: &'a [String],
    write_table_list: bool,
    notes: String,
    started: DateTime<Utc>,
}

impl SnapshotDirectoryBuilder {
    pub fn new(config: Arc<Config>, store: Arc<dyn RowStore>) -> Self {
        Self { config, store }
    }

    /// Snapshot every table of `class`, write the records, then apply
    /// retention for the class.
    pub async fn run(&self, class: BackupClass) -> Result<BackupRun> {
        let started = Utc::now();
        let tables = self.config.tables.tables(class);
        info!(
            "Starting {} backup of {} tables from {}",
            class,
            tables.len(),
            self.store.describe()
        );

        let mut notes = match class {
            BackupClass::Critical => "Critical tables backup.".to_string(),
            BackupClass::Full => "Full backup of all application tables.".to_string(),
        };
        notes.push(' ');
        notes.push_str(CONSISTENCY_NOTE);
        if self.config.backup.compress {
            warn!("Compression was requested but is not supported yet (planned); writing plain JSON");
            notes.push_str(" Compression requested but unsupported; files are uncompressed.");
        }

        let capture = Capture {
            base_name: format!("{}{}", class.dir_prefix(), path_safe_timestamp(&started)),
            class,
            tables,
            write_table_list: class == BackupClass::Full,
            notes,
            started,
        };
        let (directory, outcomes, metadata) = self.capture(capture).await?;

        let retention = RetentionManager::new(&self.config.backup.root, self.config.retention);
        let retention = match retention.enforce_in_root(class).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Retention skipped for {} backups: {}", class, e);
                None
            }
        };

        Ok(BackupRun {
            class,
            directory,
            metadata,
            outcomes,
            retention,
        })
    }

    /// Snapshot `tables` into a `pre-restore-backup-*` directory. Missing
    /// tables are skipped. Never subject to retention.
    pub async fn safety_directory(&self, tables: &[String]) -> Result<PathBuf> {
        let started = Utc::now();
        let capture = Capture {
            base_name: format!("{SAFETY_PREFIX}{}", path_safe_timestamp(&started)),
            class: BackupClass::Full,
            tables,
            write_table_list: false,
            notes: format!("Safety backup taken before a restore. {CONSISTENCY_NOTE}"),
            started,
        };
        let (directory, _, _) = self.capture(capture).await.map_err(|e| {
            BackupError::SafetyBackup {
                message: e.to_string(),
            }
        })?;
        Ok(directory)
    }

    /// Export `tables` into a single `pre-restore-backup-*.json` dump file.
    pub async fn safety_dump(&self, tables: &[String]) -> Result<PathBuf> {
        self.write_safety_dump(tables)
            .await
            .map_err(|e| BackupError::SafetyBackup {
                message: e.to_string(),
            })
    }

    async fn write_safety_dump(&self, tables: &[String]) -> Result<PathBuf> {
        let started = Utc::now();
        let mut snapshots = Vec::with_capacity(tables.len());
        for table in tables {
            match read_table(self.store.as_ref(), table, self.config.row_store.page_size).await {
                Ok(rows) => snapshots.push(TableSnapshot::new(table, rows)),
                Err(BackupError::TableNotFound { .. }) => {
                    warn!("Table {} does not exist, leaving it out of the safety dump", table);
                }
                Err(e) => return Err(e),
            }
        }

        let dump = DumpFile {
            timestamp: started,
            version: FORMAT_VERSION.to_string(),
            database: self.config.target_host(),
            tables: snapshots,
        };

        fs::create_dir_all(&self.config.backup.root).await?;
        let path = self.config.backup.root.join(format!(
            "{SAFETY_PREFIX}{}.{SNAPSHOT_EXTENSION}",
            path_safe_timestamp(&started)
        ));
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(&serde_json::to_vec_pretty(&dump)?).await?;
        file.flush().await?;

        info!("Safety dump written to {}", path.display());
        Ok(path)
    }

    async fn capture(
        &self,
        capture: Capture<'_>,
    ) -> Result<(PathBuf, Vec<SnapshotOutcome>, Metadata)> {
        let directory = create_unique_dir(&self.config.backup.root, &capture.base_name).await?;

        match self.capture_into(&directory, &capture).await {
            Ok((outcomes, metadata)) => {
                info!(
                    "{} snapshot complete: {} ({} tables)",
                    capture.class,
                    directory.display(),
                    metadata.tables.len()
                );
                Ok((directory, outcomes, metadata))
            }
            Err(e) => {
                error!("Snapshot aborted, removing incomplete {}: {}", directory.display(), e);
                if let Err(cleanup) = fs::remove_dir_all(&directory).await {
                    warn!(
                        "Could not remove incomplete snapshot {}: {}",
                        directory.display(),
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn capture_into(
        &self,
        directory: &Path,
        capture: &Capture<'_>,
    ) -> Result<(Vec<SnapshotOutcome>, Metadata)> {
        let snapshotter = TableSnapshotter::new(self.store.clone(), self.config.row_store.page_size);

        let mut outcomes = Vec::with_capacity(capture.tables.len());
        for table in capture.tables {
            outcomes.push(snapshotter.snapshot(table, directory, capture.class).await?);
        }

        let skipped_tables: Vec<String> = outcomes
            .iter()
            .filter(|o| matches!(o, SnapshotOutcome::SkippedMissing { .. }))
            .map(|o| o.table().to_string())
            .collect();

        if capture.write_table_list {
            TableListRecord {
                catalog_version: self.config.tables.version.clone(),
                class: capture.class,
                tables: capture.tables.to_vec(),
            }
            .write_to(directory)
            .await?;
        }

        // Written last: its presence marks the directory as complete.
        let metadata = Metadata {
            timestamp: capture.started,
            class: capture.class,
            tables: capture.tables.to_vec(),
            database: self.config.target_host(),
            version: FORMAT_VERSION.to_string(),
            method: CAPTURE_METHOD.to_string(),
            notes: capture.notes.clone(),
            skipped_tables,
        };
        metadata.write_to(directory).await?;

        Ok((outcomes, metadata))
    }
}
