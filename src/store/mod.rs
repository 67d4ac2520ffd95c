//! Row-store capability.
//!
//! Everything the toolchain does against the live database goes through
//! [`RowStore`]: paginated reads, batched idempotent inserts, whole-script
//! replay, and optional table listing. No lock or transaction is ever held
//! across calls.

pub mod postgres;
pub mod rest;

pub use postgres::PostgresRowStore;
pub use rest::RestRowStore;

use crate::config::{Config, RowStoreBackend};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// A table row as exported: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Short, credential-free description for logs.
    fn describe(&self) -> String;

    /// Read one page of rows. Returns `BackupError::TableNotFound` when the
    /// relation does not exist.
    async fn select_page(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<Row>>;

    /// Insert `rows` as one multi-row statement, skipping rows that already
    /// exist. Returns how many rows were actually inserted.
    async fn insert_missing(&self, table: &str, rows: &[Row]) -> Result<u64>;

    /// Apply a full SQL script as a single operation.
    async fn execute_script(&self, script: &str) -> Result<()>;

    /// Tables visible in the store, if the backend can enumerate them.
    async fn list_tables(&self) -> Result<Option<Vec<String>>> {
        Ok(None)
    }
}

/// Read a whole table, one page at a time, until an empty page comes back.
///
/// A short page is not treated as the end: hosted endpoints cap responses at
/// their own row limit, which may be below `page_size`.
pub async fn read_table(store: &dyn RowStore, table: &str, page_size: usize) -> Result<Vec<Row>> {
    let page_size = page_size.max(1);
    let mut rows = Vec::new();
    let mut offset = 0;

    loop {
        let page = store.select_page(table, offset, page_size).await?;
        let fetched = page.len();
        if fetched == 0 {
            break;
        }
        if fetched < page_size {
            debug!(
                "Short page from {} at offset {} ({} of {} rows), continuing",
                table, offset, fetched, page_size
            );
        }
        rows.extend(page);
        debug!("Read {} rows from {} at offset {}", fetched, table, offset);
        offset += fetched;
    }

    Ok(rows)
}

/// Build the row store selected by configuration.
pub async fn connect(config: &Config) -> Result<Arc<dyn RowStore>> {
    match config.row_store.backend {
        RowStoreBackend::Postgres => {
            let store = PostgresRowStore::connect(&config.database).await?;
            Ok(Arc::new(store))
        }
        RowStoreBackend::Rest => {
            let store = RestRowStore::new(&config.row_store)?;
            Ok(Arc::new(store))
        }
    }
}

/// Connects on first use, so paths that never touch the store (dry runs,
/// refused restores) never open a connection.
pub struct LazyRowStore {
    config: Config,
    inner: OnceCell<Arc<dyn RowStore>>,
}

impl LazyRowStore {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            inner: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.initialized()
    }

    async fn get(&self) -> Result<&Arc<dyn RowStore>> {
        self.inner.get_or_try_init(|| connect(&self.config)).await
    }
}

#[async_trait]
impl RowStore for LazyRowStore {
    fn describe(&self) -> String {
        match self.inner.get() {
            Some(store) => store.describe(),
            None => format!(
                "{} row store at {} (not connected)",
                self.config.row_store.backend,
                self.config.target_host()
            ),
        }
    }

    async fn select_page(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<Row>> {
        self.get().await?.select_page(table, offset, limit).await
    }

    async fn insert_missing(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.get().await?.insert_missing(table, rows).await
    }

    async fn execute_script(&self, script: &str) -> Result<()> {
        self.get().await?.execute_script(script).await
    }

    async fn list_tables(&self) -> Result<Option<Vec<String>>> {
        self.get().await?.list_tables().await
    }
}
