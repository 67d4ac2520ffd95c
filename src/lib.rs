pub mod backup;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod restore;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use error::{BackupError, Result};

// Re-export catalog types
pub use catalog::{BackupClass, TableCatalog, CATALOG_VERSION};

// Re-export backup types
pub use backup::{
    BackupRun, DumpFile, Metadata, RetentionManager, RetentionPlan, RetentionReport,
    SnapshotDirectoryBuilder, SnapshotOutcome, TableSnapshot, TableSnapshotter,
};

// Re-export restore types
pub use restore::{
    RestoreExecutor, RestoreOutcome, RestoreReport, RestoreRequest, TableRestoreOutcome,
    TableRestoreStatus, RESTORE_BATCH_SIZE,
};

// Re-export row store types
pub use store::{PostgresRowStore, RestRowStore, Row, RowStore};

pub use scheduler::Scheduler;
