use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use event_backup::cli::{self, CONCURRENCY_NOTE};
use event_backup::logging;
use event_backup::scheduler::{render_listing, Scheduler};
use event_backup::store;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "scheduler")]
#[command(about = "Manage backup schedules and inspect stored snapshots")]
#[command(after_help = CONCURRENCY_NOTE)]
#[command(version)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["setup", "status", "list", "cleanup", "test"])
))]
struct Cli {
    /// Write the cron job file and create the log directory
    #[arg(long)]
    setup: bool,

    /// Show configuration, latest snapshots and installed jobs
    #[arg(long)]
    status: bool,

    /// List stored snapshots, newest first
    #[arg(long)]
    list: bool,

    /// Apply retention to both backup classes now
    #[arg(long)]
    cleanup: bool,

    /// Run the self-test without changing any data
    #[arg(long)]
    test: bool,

    /// Directory holding the backup binaries (defaults to this binary's directory)
    #[arg(long, value_name = "PATH")]
    bin_dir: Option<PathBuf>,
}

fn default_bin_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Could not locate the current executable")?;
    exe.parent()
        .map(|p| p.to_path_buf())
        .context("Executable has no parent directory")
}

async fn run(args: Cli) -> Result<String> {
    let config = Arc::new(cli::load_config(None, false)?);
    let scheduler = Scheduler::new(config.clone());

    if args.setup {
        let bin_dir = match args.bin_dir {
            Some(dir) => dir,
            None => default_bin_dir()?,
        };
        let work_dir = std::env::current_dir()?;
        let (path, crontab) = scheduler.setup(&bin_dir, &work_dir).await?;
        print!("{crontab}");
        return Ok(format!(
            "Job definitions written to {}; install them with `crontab {}`",
            path.display(),
            path.display()
        ));
    }

    if args.status {
        print!("{}", scheduler.status().await?);
        return Ok("Status report complete".to_string());
    }

    if args.list {
        let listings = scheduler.list().await?;
        print!("{}", render_listing(&listings));
        return Ok(format!("{} snapshot(s) stored", listings.len()));
    }

    if args.cleanup {
        config.validate()?;
        let mut deleted = 0;
        let mut failed = 0;
        for (class, report) in scheduler.cleanup().await? {
            println!(
                "  {class}: kept {}, deleted {}, failed {}",
                report.kept.len(),
                report.deleted.len(),
                report.failed.len()
            );
            for (path, reason) in &report.failed {
                println!("    could not remove {}: {reason}", path.display());
            }
            deleted += report.deleted.len();
            failed += report.failed.len();
        }
        if failed > 0 {
            bail!("Cleanup removed {deleted} snapshot(s) but {failed} could not be deleted");
        }
        return Ok(format!("Cleanup removed {deleted} snapshot(s)"));
    }

    let store = store::connect(&config).await;
    let report = scheduler.self_test(store).await;
    print!("{}", report.render());
    if !report.passed() {
        bail!("Self-test failed");
    }
    Ok("Self-test passed".to_string())
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
