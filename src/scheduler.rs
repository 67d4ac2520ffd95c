//! Scheduling and status front-end.
//!
//! Everything here is read-only or administrative. `setup` writes a job file
//! for the operator to install; nothing is ever installed automatically.

use crate::backup::{list_snapshot_entries, Metadata, RetentionManager, RetentionReport, SnapshotEntry};
use crate::catalog::BackupClass;
use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::restore::{RestoreExecutor, RestoreOutcome, RestoreRequest};
use crate::store::RowStore;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

pub const JOB_FILE: &str = "backup-crontab.txt";
pub const LOG_DIR: &str = "logs";
const TOOL_NAMES: &[&str] = &["backup-critical", "backup-full"];

/// Cron lines currently installed for this toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstalledJobs {
    Installed(Vec<String>),
    NoCrontab,
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct SnapshotListing {
    pub name: String,
    pub path: PathBuf,
    pub kind: String,
    pub size_bytes: u64,
    pub age: Duration,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone)]
pub struct SelfTestCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct SelfTestReport {
    pub checks: Vec<SelfTestCheck>,
}

impl SelfTestReport {
    fn record(&mut self, name: &'static str, status: CheckStatus, detail: impl Into<String>) {
        self.checks.push(SelfTestCheck {
            name,
            status,
            detail: detail.into(),
        });
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }

    pub fn render(&self) -> String {
        self.checks
            .iter()
            .map(|c| {
                let tag = match c.status {
                    CheckStatus::Pass => "PASS",
                    CheckStatus::Warn => "WARN",
                    CheckStatus::Fail => "FAIL",
                };
                format!("  [{tag}] {}: {}\n", c.name, c.detail)
            })
            .collect()
    }
}

pub struct Scheduler {
    config: Arc<Config>,
}

impl Scheduler {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Render the crontab for both backup classes.
    pub fn render_crontab(&self, bin_dir: &Path, work_dir: &Path) -> String {
        let log_dir = self.config.backup.root.join(LOG_DIR);
        let mut out = String::new();
        out.push_str(&format!(
            "# event-backup schedules, generated {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str("# Install with: crontab <this file>  (replaces the current crontab; merge by hand if needed)\n");
        out.push_str("# Only one backup or restore may run against the database at a time.\n");

        for (tool, schedule) in [
            ("backup-critical", &self.config.backup.critical_schedule),
            ("backup-full", &self.config.backup.full_schedule),
        ] {
            out.push_str(&format!(
                "{schedule} cd {} && {} >> {} 2>&1\n",
                work_dir.display(),
                bin_dir.join(tool).display(),
                log_dir.join(format!("{tool}.log")).display()
            ));
        }
        out
    }

    /// Write the job file and create the log directory it points at.
    /// Returns the file path and the exact text written.
    pub async fn setup(&self, bin_dir: &Path, work_dir: &Path) -> Result<(PathBuf, String)> {
        let root = &self.config.backup.root;
        fs::create_dir_all(root.join(LOG_DIR)).await?;

        let path = root.join(JOB_FILE);
        let crontab = self.render_crontab(bin_dir, work_dir);
        fs::write(&path, &crontab).await?;
        info!("Wrote cron job definitions to {}", path.display());
        Ok((path, crontab))
    }

    pub async fn installed_jobs(&self) -> InstalledJobs {
        let output = match Command::new("crontab").arg("-l").output().await {
            Ok(output) => output,
            Err(e) => return InstalledJobs::Unavailable(format!("crontab not available: {e}")),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_ascii_lowercase().contains("no crontab") {
                return InstalledJobs::NoCrontab;
            }
            return InstalledJobs::Unavailable(stderr.trim().to_string());
        }

        InstalledJobs::Installed(filter_job_lines(&String::from_utf8_lossy(&output.stdout)))
    }

    pub async fn list(&self) -> Result<Vec<SnapshotListing>> {
        let now = SystemTime::now();
        let entries = list_snapshot_entries(&self.config.backup.root).await?;
        Ok(entries
            .into_iter()
            .map(|entry| SnapshotListing {
                kind: entry_kind(&entry),
                size_bytes: entry.size_bytes(),
                age: now.duration_since(entry.modified).unwrap_or_default(),
                complete: entry.is_complete() || (!entry.is_dir && entry.is_safety_backup()),
                name: entry.name,
                path: entry.path,
            })
            .collect())
    }

    pub async fn status(&self) -> Result<String> {
        let mut out = self.config.diagnostic_report();
        let entries = list_snapshot_entries(&self.config.backup.root).await?;

        out.push_str("\n=== Latest Snapshots ===\n");
        for class in BackupClass::ALL {
            let latest = entries
                .iter()
                .find(|e| e.class() == Some(class) && e.is_complete());
            match latest {
                Some(entry) => {
                    let when = Metadata::load(&entry.path)
                        .await
                        .map(|m| m.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                        .unwrap_or_else(|_| "unknown time".to_string());
                    out.push_str(&format!("  {class}: {} ({when})\n", entry.name));
                }
                None => out.push_str(&format!("  {class}: none\n")),
            }
            let count = entries
                .iter()
                .filter(|e| e.class() == Some(class) && e.is_dir)
                .count();
            out.push_str(&format!(
                "    {count} stored, retention keeps {}\n",
                self.config.retention.keep_count(class)
            ));
        }

        out.push_str("\n=== Installed Jobs ===\n");
        match self.installed_jobs().await {
            InstalledJobs::Installed(lines) if lines.is_empty() => {
                out.push_str("  No backup jobs in the crontab (run `scheduler --setup`)\n")
            }
            InstalledJobs::Installed(lines) => {
                for line in lines {
                    out.push_str(&format!("  {line}\n"));
                }
            }
            InstalledJobs::NoCrontab => out.push_str("  No crontab installed for this user\n"),
            InstalledJobs::Unavailable(reason) => {
                out.push_str(&format!("  Could not read crontab: {reason}\n"))
            }
        }

        Ok(out)
    }

    pub async fn cleanup(&self) -> Result<Vec<(BackupClass, RetentionReport)>> {
        let manager = RetentionManager::new(&self.config.backup.root, self.config.retention);
        let mut reports = Vec::new();
        for class in BackupClass::ALL {
            reports.push((class, manager.enforce_in_root(class).await?));
        }
        Ok(reports)
    }

    /// Exercise every component without changing data.
    pub async fn self_test(&self, store: Result<Arc<dyn RowStore>>) -> SelfTestReport {
        let mut report = SelfTestReport::default();

        match self.config.validate() {
            Ok(()) => report.record("configuration", CheckStatus::Pass, "valid"),
            Err(e) => report.record("configuration", CheckStatus::Fail, e.to_string()),
        }

        match check_writable(&self.config.backup.root).await {
            Ok(()) => report.record(
                "backup root",
                CheckStatus::Pass,
                format!("{} is writable", self.config.backup.root.display()),
            ),
            Err(e) => report.record("backup root", CheckStatus::Fail, e.to_string()),
        }

        let store = match store {
            Ok(store) => {
                report.record("row store", CheckStatus::Pass, store.describe());
                Some(store)
            }
            Err(e) => {
                report.record("row store", CheckStatus::Fail, e.to_string());
                None
            }
        };

        if let Some(store) = &store {
            self.check_critical_tables(store.as_ref(), &mut report).await;
            self.check_drift(store.as_ref(), &mut report).await;
        }

        self.check_retention(&mut report).await;

        match &store {
            Some(store) => self.check_restore_dry_run(store.clone(), &mut report).await,
            None => report.record(
                "restore dry-run",
                CheckStatus::Warn,
                "skipped, row store unavailable",
            ),
        }

        report
    }

    async fn check_critical_tables(&self, store: &dyn RowStore, report: &mut SelfTestReport) {
        let mut missing = Vec::new();
        for table in &self.config.tables.critical {
            match store.select_page(table, 0, 1).await {
                Ok(_) => debug!("Critical table {} is readable", table),
                Err(BackupError::TableNotFound { .. }) => missing.push(table.clone()),
                Err(e) => {
                    report.record("critical tables", CheckStatus::Fail, e.to_string());
                    return;
                }
            }
        }
        if missing.is_empty() {
            report.record(
                "critical tables",
                CheckStatus::Pass,
                format!("{} readable", self.config.tables.critical.len()),
            );
        } else {
            report.record(
                "critical tables",
                CheckStatus::Fail,
                format!("missing: {}", missing.join(", ")),
            );
        }
    }

    async fn check_drift(&self, store: &dyn RowStore, report: &mut SelfTestReport) {
        match store.list_tables().await {
            Ok(Some(live)) => {
                let unlisted = self.config.tables.drift(&live);
                if unlisted.is_empty() {
                    report.record("schema drift", CheckStatus::Pass, "catalog covers every table");
                } else {
                    report.record(
                        "schema drift",
                        CheckStatus::Warn,
                        format!(
                            "not in catalog v{}: {}",
                            self.config.tables.version,
                            unlisted.join(", ")
                        ),
                    );
                }
            }
            Ok(None) => report.record(
                "schema drift",
                CheckStatus::Warn,
                "backend cannot list tables",
            ),
            Err(e) => report.record("schema drift", CheckStatus::Warn, e.to_string()),
        }
    }

    async fn check_retention(&self, report: &mut SelfTestReport) {
        let manager = RetentionManager::new(&self.config.backup.root, self.config.retention);
        let mut details = Vec::new();
        for class in BackupClass::ALL {
            match manager.plan_in_root(class).await {
                Ok(plan) => details.push(format!(
                    "{class} keeps {}, would delete {}",
                    plan.keep.len(),
                    plan.remove.len()
                )),
                Err(e) => {
                    report.record("retention", CheckStatus::Fail, e.to_string());
                    return;
                }
            }
        }
        report.record("retention", CheckStatus::Pass, details.join("; "));
    }

    async fn check_restore_dry_run(&self, store: Arc<dyn RowStore>, report: &mut SelfTestReport) {
        let entries = match list_snapshot_entries(&self.config.backup.root).await {
            Ok(entries) => entries,
            Err(e) => {
                report.record("restore dry-run", CheckStatus::Fail, e.to_string());
                return;
            }
        };
        let Some(latest) = entries
            .iter()
            .find(|e| e.class().is_some() && e.is_complete())
        else {
            report.record("restore dry-run", CheckStatus::Warn, "no complete snapshot yet");
            return;
        };

        let executor = RestoreExecutor::new(self.config.clone(), store);
        let request = RestoreRequest {
            backup_dir: Some(latest.path.clone()),
            dry_run: true,
            ..RestoreRequest::default()
        };
        match executor.execute(&request).await {
            Ok(RestoreOutcome::Completed(result)) if result.success => report.record(
                "restore dry-run",
                CheckStatus::Pass,
                format!(
                    "{}: {} tables, {} rows",
                    latest.name,
                    result.tables.len(),
                    result.rows_in_snapshot()
                ),
            ),
            Ok(RestoreOutcome::Completed(result)) => report.record(
                "restore dry-run",
                CheckStatus::Fail,
                result.error.unwrap_or_else(|| "unknown error".to_string()),
            ),
            Ok(RestoreOutcome::ConfirmationRequired) => report.record(
                "restore dry-run",
                CheckStatus::Fail,
                "dry run unexpectedly asked for confirmation",
            ),
            Err(e) => report.record("restore dry-run", CheckStatus::Fail, e.to_string()),
        }
    }
}

pub fn render_listing(listings: &[SnapshotListing]) -> String {
    if listings.is_empty() {
        return "  No snapshots found\n".to_string();
    }
    listings
        .iter()
        .map(|l| {
            format!(
                "  {:<48} {:<10} {:>10} {:>10}{}\n",
                l.name,
                l.kind,
                format_bytes(l.size_bytes),
                format_age(l.age),
                if l.complete { "" } else { "  INCOMPLETE" }
            )
        })
        .collect()
}

fn entry_kind(entry: &SnapshotEntry) -> String {
    match entry.class() {
        Some(class) => class.to_string(),
        None => "safety".to_string(),
    }
}

fn filter_job_lines(crontab: &str) -> Vec<String> {
    crontab
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter(|line| TOOL_NAMES.iter().any(|tool| line.contains(tool)))
        .map(str::to_string)
        .collect()
}

async fn check_writable(root: &Path) -> Result<()> {
    fs::create_dir_all(root).await?;
    let probe = root.join(".write-test");
    fs::write(&probe, b"test").await?;
    let _ = fs::remove_file(&probe).await;
    Ok(())
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    match secs {
        s if s < 60 => format!("{s}s ago"),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_crontab_uses_schedules() {
        let mut config = Config::default();
        config.backup.root = PathBuf::from("/srv/backups");
        config.backup.critical_schedule = "15 1 * * *".to_string();
        let scheduler = Scheduler::new(Arc::new(config));

        let crontab = scheduler.render_crontab(Path::new("/opt/tools"), Path::new("/srv/app"));
        let jobs: Vec<&str> = crontab.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].starts_with("15 1 * * * cd /srv/app && /opt/tools/backup-critical"));
        assert!(jobs[0].ends_with(">> /srv/backups/logs/backup-critical.log 2>&1"));
        assert!(jobs[1].starts_with("0 3 * * 0 "));
        assert!(jobs[1].contains("/opt/tools/backup-full"));
    }

    #[test]
    fn test_filter_job_lines() {
        let crontab = "\
# backup-critical nightly
0 2 * * * /opt/tools/backup-critical
*/5 * * * * /usr/bin/other-job
0 3 * * 0 /opt/tools/backup-full >> /tmp/x 2>&1
";
        assert_eq!(
            filter_job_lines(crontab),
            vec![
                "0 2 * * * /opt/tools/backup-critical".to_string(),
                "0 3 * * 0 /opt/tools/backup-full >> /tmp/x 2>&1".to_string(),
            ]
        );
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_age(Duration::from_secs(30)), "30s ago");
        assert_eq!(format_age(Duration::from_secs(7200)), "2h ago");
        assert_eq!(format_age(Duration::from_secs(3 * 86_400)), "3d ago");
    }

    #[test]
    fn test_self_test_report_passes_with_warnings() {
        let mut report = SelfTestReport::default();
        report.record("a", CheckStatus::Pass, "ok");
        report.record("b", CheckStatus::Warn, "hmm");
        assert!(report.passed());
        report.record("c", CheckStatus::Fail, "no");
        assert!(!report.passed());
        assert!(report.render().contains("[FAIL] c: no"));
    }
}
