use clap::Parser;
use event_backup::catalog::BackupClass;
use event_backup::cli::{self, CONCURRENCY_NOTE};
use event_backup::logging;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "backup-full")]
#[command(about = "Snapshot every catalogued table and apply full retention")]
#[command(after_help = CONCURRENCY_NOTE)]
#[command(version)]
struct Cli {
    /// Snapshot root (defaults to BACKUP_DIR or ./backups)
    #[arg(long, value_name = "PATH")]
    output_dir: Option<PathBuf>,

    /// Turn off a compression request coming from BACKUP_COMPRESS
    #[arg(long)]
    no_compress: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args::<Cli>() {
        Ok(args) => args,
        Err(code) => return code,
    };
    logging::init();

    let compress = args.no_compress.then_some(false);
    cli::finish(cli::run_backup(BackupClass::Full, args.output_dir, compress).await)
}
