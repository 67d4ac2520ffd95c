pub mod builder;
pub mod retention;
pub mod snapshotter;

pub use builder::{BackupRun, SnapshotDirectoryBuilder};
pub use retention::{RetentionManager, RetentionPlan, RetentionReport};
pub use snapshotter::{SnapshotOutcome, TableSnapshotter};

use crate::catalog::BackupClass;
use crate::error::{BackupError, Result};
use crate::store::Row;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::debug;

pub const METADATA_FILE: &str = "metadata.json";
pub const TABLE_LIST_FILE: &str = "table-list.json";
pub const SNAPSHOT_EXTENSION: &str = "json";
pub const SAFETY_PREFIX: &str = "pre-restore-backup-";

/// Snapshot format version written into every metadata record.
pub const FORMAT_VERSION: &str = "1.0";
pub const CAPTURE_METHOD: &str = "row-export";

/// One table's rows at capture time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
    pub table: String,
    pub timestamp: DateTime<Utc>,
    pub record_count: usize,
    pub data: Vec<Row>,
}

impl TableSnapshot {
    pub fn new(table: &str, data: Vec<Row>) -> Self {
        Self {
            table: table.to_string(),
            timestamp: Utc::now(),
            record_count: data.len(),
            data,
        }
    }

    pub fn file_name(table: &str) -> String {
        format!("{table}.{SNAPSHOT_EXTENSION}")
    }

    /// Write `<table>.json` into `dir`.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(Self::file_name(&self.table));
        let bytes = serde_json::to_vec_pretty(self)?;
        fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Load a snapshot file and check its stored count against the payload.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).await?;
        let snapshot: TableSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| BackupError::SnapshotCorrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        snapshot.check_count(path)?;
        Ok(snapshot)
    }

    pub fn check_count(&self, path: &Path) -> Result<()> {
        if self.record_count != self.data.len() {
            return Err(BackupError::SnapshotCorrupt {
                path: path.to_path_buf(),
                message: format!(
                    "recordCount is {} but data holds {} rows",
                    self.record_count,
                    self.data.len()
                ),
            });
        }
        Ok(())
    }
}

/// Completeness marker of a snapshot directory. Written last, never updated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub class: BackupClass,
    pub tables: Vec<String>,
    /// Target host, never a credential
    pub database: String,
    pub version: String,
    pub method: String,
    pub notes: String,
    #[serde(default)]
    pub skipped_tables: Vec<String>,
}

impl Metadata {
    /// Write via a temporary file so a reader never sees a partial record.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(METADATA_FILE);
        let tmp = dir.join(format!(".{METADATA_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let bytes = fs::read(&path).await.map_err(|e| {
            BackupError::Validation(format!(
                "{} has no readable {METADATA_FILE} ({e}); the snapshot is incomplete",
                dir.display()
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            BackupError::Validation(format!(
                "{} in {} cannot be parsed: {e}",
                METADATA_FILE,
                dir.display()
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableListRecord {
    pub catalog_version: String,
    #[serde(rename = "type")]
    pub class: BackupClass,
    pub tables: Vec<String>,
}

impl TableListRecord {
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(TABLE_LIST_FILE);
        fs::write(&path, serde_json::to_vec_pretty(self)?).await?;
        Ok(path)
    }
}

/// Single-file dump: several table snapshots in one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DumpFile {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub database: String,
    pub tables: Vec<TableSnapshot>,
}

/// Timestamp usable in a file name: `:` and `.` become `-`.
pub fn path_safe_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Create `<root>/<base>`, appending `-1`, `-2`, ... if the name is taken.
pub async fn create_unique_dir(root: &Path, base: &str) -> Result<PathBuf> {
    fs::create_dir_all(root).await?;
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            base.to_string()
        } else {
            format!("{base}-{attempt}")
        };
        let path = root.join(&name);
        match fs::create_dir(&path).await {
            Ok(()) => {
                debug!("Created snapshot directory {}", path.display());
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 100 => {
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A snapshot directory or safety artifact found under the backup root.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub is_dir: bool,
}

impl SnapshotEntry {
    pub fn class(&self) -> Option<BackupClass> {
        BackupClass::ALL
            .into_iter()
            .find(|class| self.name.starts_with(&class.dir_prefix()))
    }

    pub fn is_safety_backup(&self) -> bool {
        self.name.starts_with(SAFETY_PREFIX)
    }

    /// Only directories carrying a metadata record are restorable.
    pub fn is_complete(&self) -> bool {
        self.is_dir && self.path.join(METADATA_FILE).is_file()
    }

    pub fn size_bytes(&self) -> u64 {
        if self.is_dir {
            dir_size(&self.path)
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        }
    }
}

/// Everything directly under `root` that belongs to the toolchain.
pub async fn list_snapshot_entries(root: &Path) -> Result<Vec<SnapshotEntry>> {
    let mut entries = Vec::new();
    let mut dir = match fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = entry.metadata().await?;
        let candidate = SnapshotEntry {
            name,
            path: entry.path(),
            modified: metadata.modified()?,
            is_dir: metadata.is_dir(),
        };
        let ours = (candidate.is_dir && candidate.class().is_some())
            || candidate.is_safety_backup();
        if ours {
            entries.push(candidate);
        }
    }

    entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    Ok(entries)
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(m) if m.is_dir() => dir_size(&entry.path()),
            Ok(m) => m.len(),
            Err(_) => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_path_safe_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 2, 0, 5).unwrap();
        assert_eq!(path_safe_timestamp(&at), "2024-03-09T02-00-05-000Z");
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = TableSnapshot::new("companies", vec![row(json!({"id": 1}))]);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["table"], "companies");
        assert_eq!(value["recordCount"], 1);
        assert!(value["timestamp"].is_string());
        assert_eq!(value["data"][0]["id"], 1);
    }

    #[test]
    fn test_metadata_uses_type_key() {
        let metadata = Metadata {
            timestamp: Utc::now(),
            class: BackupClass::Full,
            tables: vec!["events".to_string()],
            database: "db.example.co".to_string(),
            version: FORMAT_VERSION.to_string(),
            method: CAPTURE_METHOD.to_string(),
            notes: String::new(),
            skipped_tables: Vec::new(),
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["type"], "full");
        assert_eq!(value["version"], "1.0");
    }

    #[tokio::test]
    async fn test_truncated_snapshot_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("booths.json");
        let body = json!({
            "table": "booths",
            "timestamp": "2024-03-09T02:00:05.000Z",
            "recordCount": 3,
            "data": [{"id": 1}, {"id": 2}]
        });
        std::fs::write(&path, body.to_string()).unwrap();

        let err = TableSnapshot::load(&path).await.unwrap_err();
        assert!(matches!(err, BackupError::SnapshotCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_metadata_missing_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let err = Metadata::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_unique_dir_appends_suffix() {
        let root = TempDir::new().unwrap();
        let first = create_unique_dir(root.path(), "full-x").await.unwrap();
        let second = create_unique_dir(root.path(), "full-x").await.unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("full-x-1"));
    }

    #[tokio::test]
    async fn test_listing_ignores_foreign_entries() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("critical-2024")).unwrap();
        std::fs::create_dir(root.path().join("random-dir")).unwrap();
        std::fs::write(root.path().join("pre-restore-backup-2024.json"), b"{}").unwrap();
        std::fs::write(root.path().join("notes.txt"), b"hi").unwrap();

        let entries = list_snapshot_entries(root.path()).await.unwrap();
        let mut names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["critical-2024", "pre-restore-backup-2024.json"]);
        assert!(!entries.iter().any(|e| e.is_complete()));
    }

    #[tokio::test]
    async fn test_missing_root_lists_nothing() {
        let root = TempDir::new().unwrap();
        let entries = list_snapshot_entries(&root.path().join("absent")).await.unwrap();
        assert!(entries.is_empty());
    }
}
