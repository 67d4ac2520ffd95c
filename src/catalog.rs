//! Static table catalog.
//!
//! Table lists are maintained by hand and versioned with
//! [`CATALOG_VERSION`]. They are never discovered from the live schema, so a
//! deployment cannot silently change what gets backed up. Tables that exist in
//! the store but not here are reported by `scheduler --test` as drift.

use crate::error::{BackupError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Bump whenever either table list changes.
pub const CATALOG_VERSION: &str = "2024.3";

const CRITICAL_TABLES: &[&str] = &["companies", "event_subscriptions", "booth_assignments"];

const FULL_TABLES: &[&str] = &[
    "companies",
    "events",
    "event_subscriptions",
    "booths",
    "booth_assignments",
    "booth_layouts",
    "locations",
    "program_items",
    "program_speakers",
    "contacts",
    "user_profiles",
    "app_settings",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupClass {
    Critical,
    Full,
}

impl BackupClass {
    pub const ALL: [BackupClass; 2] = [BackupClass::Critical, BackupClass::Full];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupClass::Critical => "critical",
            BackupClass::Full => "full",
        }
    }

    /// Directory-name prefix for snapshot runs of this class.
    pub fn dir_prefix(&self) -> String {
        format!("{}-", self.as_str())
    }

    /// A missing table aborts a critical run but is skipped in a full run.
    pub fn missing_table_is_fatal(&self) -> bool {
        matches!(self, BackupClass::Critical)
    }
}

impl fmt::Display for BackupClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupClass {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(BackupClass::Critical),
            "full" => Ok(BackupClass::Full),
            other => Err(BackupError::Validation(format!(
                "Unknown backup class '{other}', expected 'critical' or 'full'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableCatalog {
    pub version: String,
    pub critical: Vec<String>,
    pub full: Vec<String>,
}

impl Default for TableCatalog {
    fn default() -> Self {
        Self {
            version: CATALOG_VERSION.to_string(),
            critical: CRITICAL_TABLES.iter().map(|t| t.to_string()).collect(),
            full: FULL_TABLES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl TableCatalog {
    pub fn tables(&self, class: BackupClass) -> &[String] {
        match class {
            BackupClass::Critical => &self.critical,
            BackupClass::Full => &self.full,
        }
    }

    /// Tables present in `live` that the full list does not cover.
    pub fn drift<'a>(&self, live: &'a [String]) -> Vec<&'a str> {
        live.iter()
            .filter(|t| !self.full.iter().any(|known| known == *t))
            .map(String::as_str)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        for class in BackupClass::ALL {
            let tables = self.tables(class);
            if tables.is_empty() {
                return Err(BackupError::Configuration(format!(
                    "Table list for {class} backups is empty"
                )));
            }
            for table in tables {
                validate_table_name(table).map_err(|_| {
                    BackupError::Configuration(format!(
                        "Invalid table name '{table}' in {class} table list"
                    ))
                })?;
            }
        }
        Ok(())
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
    })
}

/// Accepts plain SQL identifiers only; table names end up in file names and
/// quoted SQL.
pub fn validate_table_name(name: &str) -> Result<()> {
    if identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(BackupError::Validation(format!(
            "'{name}' is not a valid table name"
        )))
    }
}
