use clap::Parser;
use event_backup::catalog::BackupClass;
use event_backup::cli::{self, CONCURRENCY_NOTE};
use event_backup::logging;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "backup-critical")]
#[command(about = "Snapshot the critical tables and apply critical retention")]
#[command(after_help = CONCURRENCY_NOTE)]
#[command(version)]
struct Cli {
    /// Snapshot root (defaults to BACKUP_DIR or ./backups)
    #[arg(long, value_name = "PATH")]
    output_dir: Option<PathBuf>,

    /// Request compression. Not supported yet: output stays plain JSON and the
    /// request is noted in the metadata.
    #[arg(long)]
    compress: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args::<Cli>() {
        Ok(args) => args,
        Err(code) => return code,
    };
    logging::init();

    let compress = args.compress.then_some(true);
    cli::finish(cli::run_backup(BackupClass::Critical, args.output_dir, compress).await)
}
