//! Restore path: validation, confirmation gate, safety backup, batched
//! idempotent replay and the resulting report.

pub mod executor;

pub use executor::RestoreExecutor;

use crate::store::Row;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Rows per generated insert statement.
pub const RESTORE_BATCH_SIZE: usize = 1000;

/// Split rows into insert batches of at most [`RESTORE_BATCH_SIZE`].
pub fn batches(rows: &[Row]) -> std::slice::Chunks<'_, Row> {
    rows.chunks(RESTORE_BATCH_SIZE)
}

/// What the operator asked for. Exactly one of `backup_file` and
/// `backup_dir` must be set.
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub backup_file: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub dry_run: bool,
    pub confirm: bool,
    pub table: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    /// Neither `--confirm` nor `--dry-run` was given; nothing happened.
    ConfirmationRequired,
    Completed(RestoreReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableRestoreStatus {
    Restored,
    WouldRestore,
    Skipped,
    Failed,
}

impl fmt::Display for TableRestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TableRestoreStatus::Restored => "restored",
            TableRestoreStatus::WouldRestore => "would-restore",
            TableRestoreStatus::Skipped => "skipped",
            TableRestoreStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRestoreOutcome {
    pub table: String,
    pub status: TableRestoreStatus,
    pub rows_in_snapshot: usize,
    pub rows_inserted: u64,
    /// Rows left untouched because they were already present
    pub rows_existing: u64,
    pub batches: usize,
}

impl TableRestoreOutcome {
    pub fn new(table: &str, status: TableRestoreStatus, rows_in_snapshot: usize) -> Self {
        Self {
            table: table.to_string(),
            status,
            rows_in_snapshot,
            rows_inserted: 0,
            rows_existing: 0,
            batches: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub source: PathBuf,
    pub dry_run: bool,
    pub success: bool,
    pub safety_backup: Option<PathBuf>,
    pub tables: Vec<TableRestoreOutcome>,
    /// Size of the script for SQL dumps
    pub script_bytes: Option<usize>,
    pub warnings: Vec<String>,
    /// The error that stopped the restore, if any
    pub error: Option<String>,
}

impl RestoreReport {
    pub fn new(source: PathBuf, dry_run: bool) -> Self {
        Self {
            source,
            dry_run,
            success: true,
            safety_backup: None,
            tables: Vec::new(),
            script_bytes: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.success = false;
        self.error = Some(message.into());
    }

    pub fn rows_inserted(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_inserted).sum()
    }

    pub fn rows_in_snapshot(&self) -> usize {
        self.tables.iter().map(|t| t.rows_in_snapshot).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableRestoreOutcome> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// Human-readable per-table lines for the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            if self.dry_run {
                out.push_str(&format!(
                    "  {:<28} {:>8} rows  {}\n",
                    table.table, table.rows_in_snapshot, table.status
                ));
            } else {
                out.push_str(&format!(
                    "  {:<28} {:>8} rows  {:>8} inserted  {:>8} existing  {}\n",
                    table.table,
                    table.rows_in_snapshot,
                    table.rows_inserted,
                    table.rows_existing,
                    table.status
                ));
            }
        }
        if let Some(bytes) = self.script_bytes {
            out.push_str(&format!("  SQL script: {bytes} bytes\n"));
        }
        for warning in &self.warnings {
            out.push_str(&format!("  warning: {warning}\n"));
        }
        out
    }
}
