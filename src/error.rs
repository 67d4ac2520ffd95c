use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Table not found: {table}")]
    TableNotFound { table: String },

    #[error("Table access failed for {table}: {message}")]
    TableAccess { table: String, message: String },

    #[error("Failed to remove expired snapshot {}: {source}", path.display())]
    RetentionCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Safety backup failed: {message}")]
    SafetyBackup { message: String },

    #[error("Snapshot file {} is corrupt: {message}", path.display())]
    SnapshotCorrupt { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BackupError {
    pub fn table_access(table: &str, message: impl Into<String>) -> Self {
        Self::TableAccess {
            table: table.to_string(),
            message: message.into(),
        }
    }

    pub fn is_table_not_found(&self) -> bool {
        matches!(self, Self::TableNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
