//! Scheduler operations: setup, listing, cleanup and the self-test.

mod test_helpers;

use event_backup::backup::METADATA_FILE;
use event_backup::scheduler::{render_listing, CheckStatus, SelfTestReport, JOB_FILE, LOG_DIR};
use event_backup::{BackupClass, BackupError, Scheduler, SnapshotDirectoryBuilder};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use test_helpers::{test_config, InMemoryRowStore};

fn check(report: &SelfTestReport, name: &str) -> CheckStatus {
    report
        .checks
        .iter()
        .find(|c| c.name == name)
        .unwrap_or_else(|| panic!("no {name} check in {report:?}"))
        .status
}

#[tokio::test]
async fn test_setup_writes_job_file_and_log_dir() {
    let root = TempDir::new().unwrap();
    let scheduler = Scheduler::new(Arc::new(test_config(root.path())));

    let (path, printed) = scheduler
        .setup(Path::new("/opt/event-backup/bin"), Path::new("/srv/admin"))
        .await
        .unwrap();

    assert_eq!(path, root.path().join(JOB_FILE));
    assert!(root.path().join(LOG_DIR).is_dir());
    let contents = std::fs::read_to_string(&path).unwrap();
    // What the operator is shown is byte-for-byte what they will install.
    assert_eq!(printed, contents);
    assert!(contents.contains("0 2 * * * cd /srv/admin && /opt/event-backup/bin/backup-critical"));
    assert!(contents.contains("0 3 * * 0 cd /srv/admin && /opt/event-backup/bin/backup-full"));
}

#[tokio::test]
async fn test_list_flags_incomplete_snapshots() {
    let root = TempDir::new().unwrap();
    let config = test_config(root.path());
    let store = InMemoryRowStore::new().with_catalog(&config);
    let config = Arc::new(config);
    let run = SnapshotDirectoryBuilder::new(config.clone(), store.as_store())
        .run(BackupClass::Full)
        .await
        .unwrap();
    std::fs::create_dir(root.path().join("critical-2020-01-01T00-00-00-000Z")).unwrap();
    std::fs::create_dir(root.path().join("unrelated")).unwrap();

    let listings = Scheduler::new(config).list().await.unwrap();

    assert_eq!(listings.len(), 2);
    let full = listings.iter().find(|l| l.path == run.directory).unwrap();
    assert_eq!(full.kind, "full");
    assert!(full.complete);
    assert!(full.size_bytes > 0);
    let partial = listings.iter().find(|l| l.kind == "critical").unwrap();
    assert!(!partial.complete);
    assert!(render_listing(&listings).contains("INCOMPLETE"));
}

#[tokio::test]
async fn test_cleanup_applies_both_policies() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(root.path());
    config.retention.critical = 1;
    config.retention.full = 1;
    for name in [
        "critical-2024-01-01T00-00-00-000Z",
        "critical-2024-01-02T00-00-00-000Z",
        "full-2024-01-01T00-00-00-000Z",
        "full-2024-01-08T00-00-00-000Z",
    ] {
        let dir = root.path().join(name);
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join(METADATA_FILE), b"{}").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(15));
    }

    let reports = Scheduler::new(Arc::new(config)).cleanup().await.unwrap();

    for (_, report) in &reports {
        assert_eq!(report.kept.len(), 1);
        assert_eq!(report.deleted.len(), 1);
        assert!(report.failed.is_empty());
    }
    assert!(root.path().join("critical-2024-01-02T00-00-00-000Z").exists());
    assert!(!root.path().join("critical-2024-01-01T00-00-00-000Z").exists());
    assert!(root.path().join("full-2024-01-08T00-00-00-000Z").exists());
}

#[tokio::test]
async fn test_self_test_passes_against_healthy_store() {
    let root = TempDir::new().unwrap();
    let config = test_config(root.path());
    let store = InMemoryRowStore::new()
        .with_catalog(&config)
        .with_table("legacy_imports", Vec::new());
    let config = Arc::new(config);
    SnapshotDirectoryBuilder::new(config.clone(), store.as_store())
        .run(BackupClass::Critical)
        .await
        .unwrap();
    let writes_before = store.insert_calls();

    let report = Scheduler::new(config).self_test(Ok(store.as_store())).await;

    assert!(report.passed(), "{}", report.render());
    assert_eq!(check(&report, "configuration"), CheckStatus::Pass);
    assert_eq!(check(&report, "backup root"), CheckStatus::Pass);
    assert_eq!(check(&report, "critical tables"), CheckStatus::Pass);
    assert_eq!(check(&report, "schema drift"), CheckStatus::Warn);
    assert_eq!(check(&report, "retention"), CheckStatus::Pass);
    assert_eq!(check(&report, "restore dry-run"), CheckStatus::Pass);
    assert!(report.render().contains("legacy_imports"));
    assert_eq!(store.insert_calls(), writes_before);
}

#[tokio::test]
async fn test_self_test_fails_without_store_or_critical_table() {
    let root = TempDir::new().unwrap();
    let config = Arc::new(test_config(root.path()));
    let scheduler = Scheduler::new(config.clone());

    let unreachable = scheduler
        .self_test(Err(BackupError::Configuration("connection refused".to_string())))
        .await;
    assert!(!unreachable.passed());
    assert_eq!(check(&unreachable, "row store"), CheckStatus::Fail);
    assert_eq!(check(&unreachable, "restore dry-run"), CheckStatus::Warn);

    let store = InMemoryRowStore::new().with_catalog(&config);
    store.drop_table("companies");
    let missing = scheduler.self_test(Ok(store.as_store())).await;
    assert!(!missing.passed());
    assert_eq!(check(&missing, "critical tables"), CheckStatus::Fail);
    assert_eq!(check(&missing, "restore dry-run"), CheckStatus::Warn);
}
