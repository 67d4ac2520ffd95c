//! Shared fixtures for the integration tests.
//!
//! `InMemoryRowStore` stands in for the live database: it pages like the
//! real backends, skips rows whose `id` is already present, and records
//! every call so tests can assert on I/O (or its absence).

#![allow(dead_code)]

use async_trait::async_trait;
use event_backup::{BackupError, Config, Result, Row, RowStore};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct StoreState {
    tables: BTreeMap<String, Vec<Row>>,
    selects: Vec<(String, usize, usize)>,
    insert_batches: Vec<(String, usize)>,
    scripts: Vec<String>,
    failing_tables: HashSet<String>,
    row_cap: Option<usize>,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryRowStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a table holding `rows`.
    pub fn with_table(self, table: &str, rows: Vec<Row>) -> Self {
        self.state
            .lock()
            .unwrap()
            .tables
            .insert(table.to_string(), rows);
        self
    }

    /// Return at most `cap` rows per read, whatever limit was asked for,
    /// like a hosted endpoint with a max-rows setting.
    pub fn with_row_cap(self, cap: usize) -> Self {
        self.state.lock().unwrap().row_cap = Some(cap);
        self
    }

    /// Every catalog table of `config`, empty.
    pub fn with_catalog(mut self, config: &Config) -> Self {
        for table in &config.tables.full {
            self = self.with_table(table, Vec::new());
        }
        self
    }

    pub fn drop_table(&self, table: &str) {
        self.state.lock().unwrap().tables.remove(table);
    }

    /// Make every insert into `table` fail.
    pub fn fail_inserts_into(&self, table: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_tables
            .insert(table.to_string());
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    pub fn selects(&self) -> Vec<(String, usize, usize)> {
        self.state.lock().unwrap().selects.clone()
    }

    pub fn insert_batches(&self, table: &str) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .insert_batches
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, size)| *size)
            .collect()
    }

    pub fn insert_calls(&self) -> usize {
        self.state.lock().unwrap().insert_batches.len()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.state.lock().unwrap().scripts.clone()
    }

    /// Total calls of any kind.
    pub fn io_calls(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.selects.len() + state.insert_batches.len() + state.scripts.len()
    }

    pub fn as_store(&self) -> Arc<dyn RowStore> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    fn describe(&self) -> String {
        "in-memory row store".to_string()
    }

    async fn select_page(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<Row>> {
        let mut state = self.state.lock().unwrap();
        state.selects.push((table.to_string(), offset, limit));
        let limit = state.row_cap.map_or(limit, |cap| limit.min(cap));
        let rows = state.tables.get(table).ok_or_else(|| BackupError::TableNotFound {
            table: table.to_string(),
        })?;
        Ok(rows.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn insert_missing(&self, table: &str, rows: &[Row]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.insert_batches.push((table.to_string(), rows.len()));
        if state.failing_tables.contains(table) {
            return Err(BackupError::table_access(table, "injected insert failure"));
        }
        let existing = state.tables.get_mut(table).ok_or_else(|| BackupError::TableNotFound {
            table: table.to_string(),
        })?;

        let mut inserted = 0;
        for row in rows {
            let duplicate = match row.get("id") {
                Some(id) => existing.iter().any(|r| r.get("id") == Some(id)),
                None => false,
            };
            if !duplicate {
                existing.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn execute_script(&self, script: &str) -> Result<()> {
        self.state.lock().unwrap().scripts.push(script.to_string());
        Ok(())
    }

    async fn list_tables(&self) -> Result<Option<Vec<String>>> {
        Ok(Some(self.state.lock().unwrap().tables.keys().cloned().collect()))
    }
}

/// `n` rows with ids `1..=n`.
pub fn sample_rows(n: usize) -> Vec<Row> {
    (1..=n).map(|i| row(json!({ "id": i, "name": format!("row {i}") }))).collect()
}

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// A valid configuration rooted at `root`.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default().with_backup_root(root);
    config.database.password = "test-password".to_string();
    config
}

/// Names of the entries directly under `root`, sorted.
pub fn entry_names(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(root) {
        Ok(dir) => dir
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

pub fn read_json(path: &Path) -> Value {
    let bytes = std::fs::read(path).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
