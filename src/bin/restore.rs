use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use event_backup::cli::{self, CONCURRENCY_NOTE};
use event_backup::logging;
use event_backup::restore::{RestoreExecutor, RestoreOutcome, RestoreRequest};
use event_backup::store::LazyRowStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "restore")]
#[command(about = "Restore rows from a snapshot directory or a dump file")]
#[command(after_help = CONCURRENCY_NOTE)]
#[command(version)]
#[command(group(ArgGroup::new("source").required(true).args(["backup_file", "backup_dir"])))]
struct Cli {
    /// A .json dump (multi-table or single table) or a .sql script
    #[arg(long, value_name = "PATH")]
    backup_file: Option<PathBuf>,

    /// A snapshot directory written by backup-critical or backup-full
    #[arg(long, value_name = "PATH")]
    backup_dir: Option<PathBuf>,

    /// Report what would be restored without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Restore only this table
    #[arg(long, value_name = "NAME")]
    table: Option<String>,

    /// Required to write to the database
    #[arg(long)]
    confirm: bool,
}

async fn run(args: Cli) -> Result<String> {
    let config = cli::load_config(None, true)?;
    let store = Arc::new(LazyRowStore::new(config.clone()));
    let executor = RestoreExecutor::new(Arc::new(config), store);

    let request = RestoreRequest {
        backup_file: args.backup_file,
        backup_dir: args.backup_dir,
        dry_run: args.dry_run,
        confirm: args.confirm,
        table: args.table,
    };

    let report = match executor.execute(&request).await.context("Restore rejected")? {
        RestoreOutcome::ConfirmationRequired => bail!(
            "Restore writes to the live database. Re-run with --confirm to proceed, \
             or with --dry-run to preview"
        ),
        RestoreOutcome::Completed(report) => report,
    };

    print!("{}", report.render());
    if let Some(path) = &report.safety_backup {
        println!("  Safety backup: {}", path.display());
    }

    if !report.success {
        bail!(
            "Restore from {} stopped: {}",
            report.source.display(),
            report.error.as_deref().unwrap_or("unknown error")
        );
    }

    if report.dry_run {
        Ok(format!(
            "Dry run of {}: {} tables, {} rows would be offered for insert",
            report.source.display(),
            report.tables.len(),
            report.rows_in_snapshot()
        ))
    } else {
        Ok(format!(
            "Restored from {}: {} rows inserted",
            report.source.display(),
            report.rows_inserted()
        ))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args::<Cli>() {
        Ok(args) => args,
        Err(code) => return code,
    };
    logging::init();

    cli::finish(run(args).await)
}
