use super::{
    batches, RestoreOutcome, RestoreReport, RestoreRequest, TableRestoreOutcome,
    TableRestoreStatus,
};
use crate::backup::{DumpFile, Metadata, SnapshotDirectoryBuilder, TableSnapshot};
use crate::catalog::validate_table_name;
use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::store::{Row, RowStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info, warn};

/// A restore input that passed validation.
#[derive(Debug)]
enum ValidatedSource {
    SqlDump {
        path: PathBuf,
        script: String,
    },
    JsonDump {
        path: PathBuf,
        snapshots: Vec<TableSnapshot>,
    },
    Directory {
        path: PathBuf,
        metadata: Metadata,
        tables: Vec<String>,
    },
}

impl ValidatedSource {
    fn path(&self) -> &Path {
        match self {
            ValidatedSource::SqlDump { path, .. }
            | ValidatedSource::JsonDump { path, .. }
            | ValidatedSource::Directory { path, .. } => path,
        }
    }
}

/// A JSON dump is either a multi-table dump file or one table snapshot.
#[derive(Deserialize)]
#[serde(untagged)]
enum JsonDocument {
    Dump(DumpFile),
    Table(TableSnapshot),
}

pub struct RestoreExecutor {
    config: Arc<Config>,
    store: Arc<dyn RowStore>,
}

impl RestoreExecutor {
    pub fn new(config: Arc<Config>, store: Arc<dyn RowStore>) -> Self {
        Self { config, store }
    }

    /// Run a restore request through validation, the confirmation gate, the
    /// safety backup and the replay.
    ///
    /// Validation problems are returned as `Err`. Once writing has started,
    /// failures are recorded in the returned report instead.
    pub async fn execute(&self, request: &RestoreRequest) -> Result<RestoreOutcome> {
        let source = self.validate(request).await?;

        if !request.dry_run && !request.confirm {
            warn!(
                "Restore from {} needs --confirm (or --dry-run to preview)",
                source.path().display()
            );
            return Ok(RestoreOutcome::ConfirmationRequired);
        }

        let mut report = RestoreReport::new(source.path().to_path_buf(), request.dry_run);

        if request.dry_run {
            info!("Dry run: nothing will be written to {}", self.store.describe());
            self.preview(&source, &mut report).await;
            return Ok(RestoreOutcome::Completed(report));
        }

        match self.take_safety_backup(&source).await {
            Ok(path) => {
                info!("Safety backup created at {}", path.display());
                report.safety_backup = Some(path);
            }
            Err(e) => {
                warn!("{}; continuing with the restore", e);
                report.warnings.push(e.to_string());
            }
        }

        self.apply(&source, &mut report).await;

        if report.success {
            info!(
                "Restore from {} finished: {} rows inserted",
                source.path().display(),
                report.rows_inserted()
            );
        } else {
            error!(
                "Restore from {} stopped: {}",
                source.path().display(),
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(RestoreOutcome::Completed(report))
    }

    async fn validate(&self, request: &RestoreRequest) -> Result<ValidatedSource> {
        if let Some(table) = &request.table {
            validate_table_name(table)?;
        }

        match (&request.backup_file, &request.backup_dir) {
            (Some(file), None) => self.validate_file(file, request.table.as_deref()).await,
            (None, Some(dir)) => self.validate_directory(dir, request.table.as_deref()).await,
            (Some(_), Some(_)) => Err(BackupError::Validation(
                "Give either --backup-file or --backup-dir, not both".to_string(),
            )),
            (None, None) => Err(BackupError::Validation(
                "One of --backup-file or --backup-dir is required".to_string(),
            )),
        }
    }

    async fn validate_file(&self, path: &Path, table: Option<&str>) -> Result<ValidatedSource> {
        let meta = fs::metadata(path).await.map_err(|e| {
            BackupError::Validation(format!("Backup file {} not accessible: {e}", path.display()))
        })?;
        if !meta.is_file() {
            return Err(BackupError::Validation(format!(
                "{} is not a file",
                path.display()
            )));
        }
        if meta.len() == 0 {
            return Err(BackupError::Validation(format!(
                "Backup file {} is empty",
                path.display()
            )));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("sql") => {
                if table.is_some() {
                    return Err(BackupError::Validation(
                        "--table cannot be used with an SQL dump; restore it whole or use a JSON snapshot"
                            .to_string(),
                    ));
                }
                let script = fs::read_to_string(path).await?;
                Ok(ValidatedSource::SqlDump {
                    path: path.to_path_buf(),
                    script,
                })
            }
            Some("json") => {
                let bytes = fs::read(path).await?;
                let document: JsonDocument = serde_json::from_slice(&bytes).map_err(|e| {
                    BackupError::Validation(format!(
                        "{} is neither a dump file nor a table snapshot: {e}",
                        path.display()
                    ))
                })?;
                let mut snapshots = match document {
                    JsonDocument::Dump(dump) => dump.tables,
                    JsonDocument::Table(snapshot) => vec![snapshot],
                };
                for snapshot in &snapshots {
                    validate_table_name(&snapshot.table)?;
                    snapshot
                        .check_count(path)
                        .map_err(|e| BackupError::Validation(e.to_string()))?;
                }
                if let Some(table) = table {
                    snapshots.retain(|s| s.table == table);
                    if snapshots.is_empty() {
                        return Err(BackupError::Validation(format!(
                            "Table {table} is not part of {}",
                            path.display()
                        )));
                    }
                }
                Ok(ValidatedSource::JsonDump {
                    path: path.to_path_buf(),
                    snapshots,
                })
            }
            _ => Err(BackupError::Validation(format!(
                "Unsupported dump format for {}; expected .json or .sql",
                path.display()
            ))),
        }
    }

    async fn validate_directory(
        &self,
        path: &Path,
        table: Option<&str>,
    ) -> Result<ValidatedSource> {
        let meta = fs::metadata(path).await.map_err(|e| {
            BackupError::Validation(format!(
                "Backup directory {} not accessible: {e}",
                path.display()
            ))
        })?;
        if !meta.is_dir() {
            return Err(BackupError::Validation(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        let metadata = Metadata::load(path).await?;
        for name in &metadata.tables {
            validate_table_name(name)?;
        }

        let tables = match table {
            Some(table) => {
                if !metadata.tables.iter().any(|t| t == table) {
                    return Err(BackupError::Validation(format!(
                        "Table {table} is not part of snapshot {}",
                        path.display()
                    )));
                }
                vec![table.to_string()]
            }
            None => metadata.tables.clone(),
        };

        Ok(ValidatedSource::Directory {
            path: path.to_path_buf(),
            metadata,
            tables,
        })
    }

    /// Report what a restore would do. Reads snapshot files, never the store.
    async fn preview(&self, source: &ValidatedSource, report: &mut RestoreReport) {
        match source {
            ValidatedSource::SqlDump { script, .. } => {
                report.script_bytes = Some(script.len());
            }
            ValidatedSource::JsonDump { snapshots, .. } => {
                for snapshot in snapshots {
                    report.tables.push(TableRestoreOutcome::new(
                        &snapshot.table,
                        TableRestoreStatus::WouldRestore,
                        snapshot.record_count,
                    ));
                }
            }
            ValidatedSource::Directory { path, tables, .. } => {
                for table in tables {
                    match load_table_file(path, table).await {
                        Ok(Some(snapshot)) => report.tables.push(TableRestoreOutcome::new(
                            table,
                            TableRestoreStatus::WouldRestore,
                            snapshot.record_count,
                        )),
                        Ok(None) => report.tables.push(TableRestoreOutcome::new(
                            table,
                            TableRestoreStatus::Skipped,
                            0,
                        )),
                        Err(e) => {
                            report
                                .tables
                                .push(TableRestoreOutcome::new(table, TableRestoreStatus::Failed, 0));
                            report.fail(e.to_string());
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn take_safety_backup(&self, source: &ValidatedSource) -> Result<PathBuf> {
        let builder = SnapshotDirectoryBuilder::new(self.config.clone(), self.store.clone());
        match source {
            ValidatedSource::Directory { tables, .. } => builder.safety_directory(tables).await,
            ValidatedSource::JsonDump { snapshots, .. } => {
                let tables: Vec<String> = snapshots.iter().map(|s| s.table.clone()).collect();
                builder.safety_dump(&tables).await
            }
            // A script may touch anything, so keep the whole catalog.
            ValidatedSource::SqlDump { .. } => builder.safety_dump(&self.config.tables.full).await,
        }
    }

    async fn apply(&self, source: &ValidatedSource, report: &mut RestoreReport) {
        match source {
            ValidatedSource::SqlDump { script, .. } => {
                report.script_bytes = Some(script.len());
                if let Err(e) = self.store.execute_script(script).await {
                    report.fail(e.to_string());
                }
            }
            ValidatedSource::JsonDump { snapshots, .. } => {
                for snapshot in snapshots {
                    if !self.restore_table(&snapshot.table, &snapshot.data, report).await {
                        return;
                    }
                }
            }
            ValidatedSource::Directory { path, metadata, tables } => {
                for table in tables {
                    match load_table_file(path, table).await {
                        Ok(Some(snapshot)) => {
                            if !self.restore_table(table, &snapshot.data, report).await {
                                return;
                            }
                        }
                        Ok(None) => {
                            if !metadata.skipped_tables.contains(table) {
                                warn!("Snapshot file for {} is missing, skipping it", table);
                            }
                            report.tables.push(TableRestoreOutcome::new(
                                table,
                                TableRestoreStatus::Skipped,
                                0,
                            ));
                        }
                        Err(e) => {
                            report
                                .tables
                                .push(TableRestoreOutcome::new(table, TableRestoreStatus::Failed, 0));
                            report.fail(e.to_string());
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Replay one table in batches. Returns `false` if a batch failed; the
    /// outcome recorded so far stays in the report.
    async fn restore_table(&self, table: &str, rows: &[Row], report: &mut RestoreReport) -> bool {
        let mut outcome =
            TableRestoreOutcome::new(table, TableRestoreStatus::Restored, rows.len());

        for batch in batches(rows) {
            match self.store.insert_missing(table, batch).await {
                Ok(inserted) => {
                    outcome.batches += 1;
                    outcome.rows_inserted += inserted;
                    outcome.rows_existing += (batch.len() as u64).saturating_sub(inserted);
                }
                Err(e) => {
                    error!("Batch {} of {} failed: {}", outcome.batches + 1, table, e);
                    outcome.status = TableRestoreStatus::Failed;
                    report.tables.push(outcome);
                    report.fail(e.to_string());
                    return false;
                }
            }
        }

        info!(
            "Restored {}: {} inserted, {} already present",
            table, outcome.rows_inserted, outcome.rows_existing
        );
        report.tables.push(outcome);
        true
    }
}

/// `Ok(None)` when the snapshot has no file for `table`.
async fn load_table_file(dir: &Path, table: &str) -> Result<Option<TableSnapshot>> {
    let path = dir.join(TableSnapshot::file_name(table));
    match fs::metadata(&path).await {
        Ok(_) => TableSnapshot::load(&path).await.map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
