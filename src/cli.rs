//! Shared plumbing for the command-line tools in `src/bin/`.

use crate::backup::{SnapshotDirectoryBuilder, SnapshotOutcome};
use crate::catalog::BackupClass;
use crate::config::Config;
use crate::store;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

pub const CONCURRENCY_NOTE: &str = "Runs are not coordinated: only one backup or restore \
process should work against the database at a time, or runs may race on directory \
creation and retention cleanup.";

/// Parse arguments; usage errors exit with status 1 like every other failure.
pub fn parse_args<T: Parser>() -> std::result::Result<T, ExitCode> {
    match T::try_parse() {
        Ok(args) => Ok(args),
        Err(e) => {
            let _ = e.print();
            if e.use_stderr() {
                Err(ExitCode::FAILURE)
            } else {
                Err(ExitCode::SUCCESS)
            }
        }
    }
}

/// Print the final summary line and map it to the exit status.
pub fn finish(result: Result<String>) -> ExitCode {
    match result {
        Ok(summary) => {
            println!("[SUCCESS] {summary}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("[ERROR] {e:#}");
            ExitCode::FAILURE
        }
    }
}

pub fn load_config(output_dir: Option<PathBuf>, validate: bool) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(dir) = output_dir {
        config = config.with_backup_root(dir);
    }
    if validate {
        config.validate()?;
    }
    Ok(config)
}

/// Shared body of `backup-critical` and `backup-full`.
pub async fn run_backup(
    class: BackupClass,
    output_dir: Option<PathBuf>,
    compress: Option<bool>,
) -> Result<String> {
    let mut config = load_config(output_dir, true)?;
    if let Some(compress) = compress {
        config.backup.compress = compress;
    }
    let config = Arc::new(config);

    info!("Backup root: {}", config.backup.root.display());
    let store = store::connect(&config)
        .await
        .context("Could not connect to the row store")?;

    let builder = SnapshotDirectoryBuilder::new(config, store);
    let run = builder
        .run(class)
        .await
        .with_context(|| format!("{class} backup failed; no metadata was written"))?;

    for outcome in &run.outcomes {
        match outcome {
            SnapshotOutcome::Written {
                table,
                record_count,
                ..
            } => println!("  {table:<28} {record_count:>8} rows"),
            SnapshotOutcome::SkippedMissing { table } => {
                println!("  {table:<28} {:>8}", "skipped (table not found)")
            }
        }
    }
    if let Some(retention) = &run.retention {
        if !retention.deleted.is_empty() {
            println!("  Removed {} expired snapshot(s)", retention.deleted.len());
        }
        for (path, reason) in &retention.failed {
            println!("  Could not remove {}: {reason}", path.display());
        }
    }

    Ok(format!(
        "{} backup written to {} ({} tables, {} rows)",
        class,
        run.directory.display(),
        run.metadata.tables.len() - run.metadata.skipped_tables.len(),
        run.total_rows()
    ))
}
