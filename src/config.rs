use crate::catalog::{validate_table_name, BackupClass, TableCatalog};
use crate::error::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Direct PostgreSQL connection settings
    pub database: DatabaseConfig,

    /// Which row-store backend to talk to, and the REST endpoint settings
    pub row_store: RowStoreConfig,

    /// Snapshot root, schedules and compression request
    pub backup: BackupSettings,

    /// How many snapshot directories to keep per class
    pub retention: RetentionPolicy,

    /// Versioned table lists
    pub tables: TableCatalog,

    /// Reserved notification destinations (not delivered yet)
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Require TLS for the connection
    pub ssl: bool,
    /// Maximum pooled connections. Work is sequential, so this stays small.
    pub max_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStoreBackend {
    Postgres,
    Rest,
}

impl FromStr for RowStoreBackend {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(RowStoreBackend::Postgres),
            "rest" | "api" => Ok(RowStoreBackend::Rest),
            other => Err(BackupError::Configuration(format!(
                "Invalid ROW_STORE_BACKEND '{other}'. Must be 'postgres' or 'rest'"
            ))),
        }
    }
}

impl fmt::Display for RowStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowStoreBackend::Postgres => f.write_str("postgres"),
            RowStoreBackend::Rest => f.write_str("rest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiKeyKind {
    ServiceRole,
    Anon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowStoreConfig {
    pub backend: RowStoreBackend,

    /// Base URL of the hosted service, e.g. `https://xyz.example.co`
    pub url: Option<String>,

    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    pub api_key_kind: Option<ApiKeyKind>,

    /// Rows requested per read page
    pub page_size: usize,

    /// Column the REST backend orders pages by, so offsets stay stable
    pub order_column: String,

    /// Per-table replacements for `order_column`
    #[serde(default)]
    pub order_overrides: BTreeMap<String, String>,

    pub request_timeout_seconds: u64,
}

impl RowStoreConfig {
    pub fn order_column_for(&self, table: &str) -> &str {
        self.order_overrides
            .get(table)
            .map(String::as_str)
            .unwrap_or(&self.order_column)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Root directory holding every snapshot directory
    pub root: PathBuf,

    /// Compression was requested. Not implemented; output is always plain JSON.
    pub compress: bool,

    /// Cron expression for `backup-critical`
    pub critical_schedule: String,

    /// Cron expression for `backup-full`
    pub full_schedule: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub critical: usize,
    pub full: usize,
}

impl RetentionPolicy {
    pub fn keep_count(&self, class: BackupClass) -> usize {
        match class {
            BackupClass::Critical => self.critical,
            BackupClass::Full => self.full,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub email_enabled: bool,
    pub email_to: Option<String>,
    pub webhook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            row_store: RowStoreConfig::default(),
            backup: BackupSettings::default(),
            retention: RetentionPolicy::default(),
            tables: TableCatalog::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            ssl: true,
            max_connections: 2,
            connect_timeout_seconds: 15,
        }
    }
}

impl Default for RowStoreConfig {
    fn default() -> Self {
        Self {
            backend: RowStoreBackend::Postgres,
            url: None,
            api_key: None,
            api_key_kind: None,
            page_size: 1000,
            order_column: "id".to_string(),
            order_overrides: BTreeMap::new(),
            request_timeout_seconds: 60,
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./backups"),
            compress: false,
            critical_schedule: "0 2 * * *".to_string(), // Daily at 2 AM
            full_schedule: "0 3 * * 0".to_string(),     // Sundays at 3 AM
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            critical: 7,
            full: 4,
        }
    }
}

impl Config {
    /// Load configuration from the environment (and `.env` if present).
    ///
    /// Only malformed values fail here; missing credentials are reported by
    /// [`Config::validate`].
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Config::default();

        // Database connection
        if let Ok(host) = env::var("DB_HOST") {
            config.database.host = host;
        }
        if let Some(port) = parse_var("DB_PORT")? {
            config.database.port = port;
        }
        if let Ok(name) = env::var("DB_NAME") {
            config.database.name = name;
        }
        if let Ok(user) = env::var("DB_USER") {
            config.database.user = user;
        }
        if let Ok(password) = env::var("DB_PASSWORD") {
            config.database.password = password;
        }
        if let Some(ssl) = parse_flag("DB_SSL")? {
            config.database.ssl = ssl;
        }

        // Row store
        if let Ok(backend) = env::var("ROW_STORE_BACKEND") {
            config.row_store.backend = backend.parse()?;
        }
        config.row_store.url = non_empty_var("SUPABASE_URL");

        if let Some(key) = non_empty_var("SUPABASE_SERVICE_ROLE_KEY") {
            config.row_store.api_key = Some(key);
            config.row_store.api_key_kind = Some(ApiKeyKind::ServiceRole);
        } else if let Some(key) = non_empty_var("SUPABASE_ANON_KEY") {
            tracing::warn!(
                "SUPABASE_SERVICE_ROLE_KEY not set, falling back to the anon key; \
                 row-level security may hide rows from backups"
            );
            config.row_store.api_key = Some(key);
            config.row_store.api_key_kind = Some(ApiKeyKind::Anon);
        }

        if let Some(page_size) = parse_var("BACKUP_PAGE_SIZE")? {
            config.row_store.page_size = page_size;
        }
        if let Some(column) = non_empty_var("BACKUP_ORDER_COLUMN") {
            config.row_store.order_column = column.trim().to_string();
        }
        if let Some(raw) = non_empty_var("BACKUP_ORDER_OVERRIDES") {
            config.row_store.order_overrides = parse_order_overrides(&raw)?;
        }

        // Backup settings
        if let Ok(dir) = env::var("BACKUP_DIR") {
            config.backup.root = PathBuf::from(dir);
        }
        if let Some(compress) = parse_flag("BACKUP_COMPRESS")? {
            config.backup.compress = compress;
        }
        if let Ok(schedule) = env::var("BACKUP_CRITICAL_SCHEDULE") {
            config.backup.critical_schedule = schedule;
        }
        if let Ok(schedule) = env::var("BACKUP_FULL_SCHEDULE") {
            config.backup.full_schedule = schedule;
        }

        // Retention
        if let Some(keep) = parse_var("BACKUP_RETENTION_CRITICAL")? {
            config.retention.critical = keep;
        }
        if let Some(keep) = parse_var("BACKUP_RETENTION_FULL")? {
            config.retention.full = keep;
        }

        // Notifications are read so `scheduler --status` can show them
        if let Some(enabled) = parse_flag("NOTIFY_EMAIL_ENABLED")? {
            config.notifications.email_enabled = enabled;
        }
        config.notifications.email_to = non_empty_var("NOTIFY_EMAIL_TO");
        config.notifications.webhook_url = non_empty_var("NOTIFY_WEBHOOK_URL");

        Ok(config)
    }

    /// Fail fast before any I/O when the selected backend lacks credentials
    /// or a setting is out of range.
    pub fn validate(&self) -> Result<()> {
        match self.row_store.backend {
            RowStoreBackend::Postgres => {
                if self.database.password.is_empty() {
                    return Err(BackupError::Configuration(
                        "DB_PASSWORD is required for the postgres backend".to_string(),
                    ));
                }
                if self.database.host.is_empty() || self.database.name.is_empty() {
                    return Err(BackupError::Configuration(
                        "DB_HOST and DB_NAME must not be empty".to_string(),
                    ));
                }
            }
            RowStoreBackend::Rest => {
                let url = self.row_store.url.as_deref().ok_or_else(|| {
                    BackupError::Configuration(
                        "SUPABASE_URL is required for the rest backend".to_string(),
                    )
                })?;
                url::Url::parse(url).map_err(|e| {
                    BackupError::Configuration(format!("Invalid SUPABASE_URL: {e}"))
                })?;
                if self.row_store.api_key.is_none() {
                    return Err(BackupError::Configuration(
                        "SUPABASE_SERVICE_ROLE_KEY or SUPABASE_ANON_KEY is required for the rest backend"
                            .to_string(),
                    ));
                }
            }
        }

        if self.retention.critical == 0 || self.retention.full == 0 {
            return Err(BackupError::Configuration(
                "Retention counts must be greater than 0".to_string(),
            ));
        }

        if self.row_store.page_size == 0 {
            return Err(BackupError::Configuration(
                "BACKUP_PAGE_SIZE must be greater than 0".to_string(),
            ));
        }

        let order_columns = std::iter::once(&self.row_store.order_column)
            .chain(self.row_store.order_overrides.keys())
            .chain(self.row_store.order_overrides.values());
        for name in order_columns {
            validate_table_name(name).map_err(|_| {
                BackupError::Configuration(format!("'{name}' is not a valid identifier for page ordering"))
            })?;
        }

        for (name, schedule) in [
            ("BACKUP_CRITICAL_SCHEDULE", &self.backup.critical_schedule),
            ("BACKUP_FULL_SCHEDULE", &self.backup.full_schedule),
        ] {
            if schedule.split_whitespace().count() != 5 {
                return Err(BackupError::Configuration(format!(
                    "{name} must be a 5-field cron expression, got '{schedule}'"
                )));
            }
        }

        self.tables.validate()
    }

    /// Snapshot root override from `--output-dir`.
    pub fn with_backup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.backup.root = root.into();
        self
    }

    /// Host recorded in snapshot metadata. Informational only.
    pub fn target_host(&self) -> String {
        match self.row_store.backend {
            RowStoreBackend::Postgres => self.database.host.clone(),
            RowStoreBackend::Rest => self
                .row_store
                .url
                .as_deref()
                .and_then(|u| url::Url::parse(u).ok())
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Connection description for logs (masks password)
    pub fn safe_database_url(&self) -> String {
        format!(
            "postgresql://{}:***@{}:{}/{}",
            self.database.user, self.database.host, self.database.port, self.database.name
        )
    }

    pub fn diagnostic_report(&self) -> String {
        let mut report = String::new();
        report.push_str("=== Backup Configuration ===\n");

        report.push_str(&format!("  Backend: {}\n", self.row_store.backend));
        match self.row_store.backend {
            RowStoreBackend::Postgres => {
                report.push_str(&format!("  Database: {}\n", self.safe_database_url()));
                report.push_str(&format!("  SSL: {}\n", self.database.ssl));
                report.push_str(&format!(
                    "  Password: {}\n",
                    secret_status(Some(self.database.password.as_str()))
                ));
            }
            RowStoreBackend::Rest => {
                report.push_str(&format!(
                    "  Endpoint: {}\n",
                    self.row_store.url.as_deref().unwrap_or("Not set")
                ));
                report.push_str(&format!(
                    "  API Key: {}{}\n",
                    secret_status(self.row_store.api_key.as_deref()),
                    match self.row_store.api_key_kind {
                        Some(ApiKeyKind::ServiceRole) => " (service role)",
                        Some(ApiKeyKind::Anon) => " (anon, reduced privileges)",
                        None => "",
                    }
                ));
            }
        }
        report.push_str(&format!("  Page size: {} rows\n", self.row_store.page_size));
        if self.row_store.backend == RowStoreBackend::Rest {
            report.push_str(&format!(
                "  Page order: {}{}\n",
                self.row_store.order_column,
                if self.row_store.order_overrides.is_empty() {
                    String::new()
                } else {
                    let overrides: Vec<String> = self
                        .row_store
                        .order_overrides
                        .iter()
                        .map(|(table, column)| format!("{table}={column}"))
                        .collect();
                    format!(" (overrides: {})", overrides.join(", "))
                }
            ));
        }

        report.push_str(&format!("  Backup root: {}\n", self.backup.root.display()));
        report.push_str(&format!(
            "  Compression: {}\n",
            if self.backup.compress {
                "requested (unsupported, planned; output stays uncompressed)"
            } else {
                "off"
            }
        ));
        report.push_str(&format!(
            "  Retention: critical={} full={}\n",
            self.retention.critical, self.retention.full
        ));
        report.push_str(&format!(
            "  Table catalog v{}: {} critical, {} full\n",
            self.tables.version,
            self.tables.critical.len(),
            self.tables.full.len()
        ));
        report.push_str(&format!(
            "  Notifications: email={} webhook={} (not delivered yet)\n",
            if self.notifications.email_enabled {
                self.notifications.email_to.as_deref().unwrap_or("enabled, no recipient")
            } else {
                "off"
            },
            if self.notifications.webhook_url.is_some() {
                "configured"
            } else {
                "off"
            }
        ));

        match self.validate() {
            Ok(_) => report.push_str("  Validation: passed\n"),
            Err(e) => report.push_str(&format!("  Validation: {e}\n")),
        }
        report
    }
}

fn secret_status(value: Option<&str>) -> &'static str {
    match value {
        Some(v) if !v.is_empty() => "***configured***",
        _ => "Not set",
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| BackupError::Configuration(format!("Invalid {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn parse_flag(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(BackupError::Configuration(format!(
                "Invalid {name}: expected a boolean, got '{other}'"
            ))),
        },
        Err(_) => Ok(None),
    }
}

/// `table=column,table=column`
fn parse_order_overrides(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut overrides = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (table, column) = pair.split_once('=').ok_or_else(|| {
            BackupError::Configuration(format!(
                "Invalid BACKUP_ORDER_OVERRIDES entry '{pair}': expected table=column"
            ))
        })?;
        overrides.insert(table.trim().to_string(), column.trim().to_string());
    }
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DB_HOST",
        "DB_PORT",
        "DB_NAME",
        "DB_USER",
        "DB_PASSWORD",
        "DB_SSL",
        "ROW_STORE_BACKEND",
        "SUPABASE_URL",
        "SUPABASE_SERVICE_ROLE_KEY",
        "SUPABASE_ANON_KEY",
        "BACKUP_PAGE_SIZE",
        "BACKUP_ORDER_COLUMN",
        "BACKUP_ORDER_OVERRIDES",
        "BACKUP_DIR",
        "BACKUP_COMPRESS",
        "BACKUP_RETENTION_CRITICAL",
        "BACKUP_RETENTION_FULL",
        "BACKUP_CRITICAL_SCHEDULE",
        "BACKUP_FULL_SCHEDULE",
        "NOTIFY_EMAIL_ENABLED",
        "NOTIFY_EMAIL_TO",
        "NOTIFY_WEBHOOK_URL",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.retention.critical, 7);
        assert_eq!(config.retention.full, 4);
        assert_eq!(config.row_store.page_size, 1000);
        assert_eq!(config.backup.root, PathBuf::from("./backups"));
        assert!(!config.backup.compress);
    }

    #[test]
    fn test_missing_password_fails_validation() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(BackupError::Configuration(_))
        ));

        let mut config = Config::default();
        config.database.password = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rest_backend_requires_url_and_key() {
        let mut config = Config::default();
        config.row_store.backend = RowStoreBackend::Rest;
        assert!(config.validate().is_err());

        config.row_store.url = Some("https://abc.example.co".to_string());
        assert!(config.validate().is_err());

        config.row_store.api_key = Some("key".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.target_host(), "abc.example.co");
    }

    #[test]
    fn test_zero_retention_rejected() {
        let mut config = Config::default();
        config.database.password = "secret".to_string();
        config.retention.full = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_schedule_rejected() {
        let mut config = Config::default();
        config.database.password = "secret".to_string();
        config.backup.full_schedule = "weekly".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() {
        clear_env();
        env::set_var("DB_HOST", "db.internal");
        env::set_var("DB_PORT", "6543");
        env::set_var("DB_PASSWORD", "hunter2");
        env::set_var("DB_SSL", "false");
        env::set_var("BACKUP_DIR", "/srv/backups");
        env::set_var("BACKUP_RETENTION_CRITICAL", "3");
        env::set_var("BACKUP_COMPRESS", "yes");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 6543);
        assert!(!config.database.ssl);
        assert_eq!(config.backup.root, PathBuf::from("/srv/backups"));
        assert_eq!(config.retention.critical, 3);
        assert_eq!(config.retention.full, 4);
        assert!(config.backup.compress);
        assert!(config.validate().is_ok());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_number_is_configuration_error() {
        clear_env();
        env::set_var("DB_PORT", "not-a-port");
        assert!(matches!(
            Config::from_env(),
            Err(BackupError::Configuration(_))
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_anon_key_fallback() {
        clear_env();
        env::set_var("ROW_STORE_BACKEND", "rest");
        env::set_var("SUPABASE_URL", "https://abc.example.co");
        env::set_var("SUPABASE_ANON_KEY", "anon-key");

        let config = Config::from_env().unwrap();
        assert_eq!(config.row_store.api_key_kind, Some(ApiKeyKind::Anon));
        assert!(config.validate().is_ok());

        env::set_var("SUPABASE_SERVICE_ROLE_KEY", "service-key");
        let config = Config::from_env().unwrap();
        assert_eq!(config.row_store.api_key_kind, Some(ApiKeyKind::ServiceRole));
        assert_eq!(config.row_store.api_key.as_deref(), Some("service-key"));

        clear_env();
    }

    #[test]
    fn test_diagnostic_report_hides_secrets() {
        let mut config = Config::default();
        config.database.password = "super-secret-password".to_string();
        let report = config.diagnostic_report();
        assert!(!report.contains("super-secret-password"));
        assert!(report.contains("***configured***"));
        assert!(report.contains("Validation: passed"));
    }

    #[test]
    #[serial]
    fn test_order_column_overrides() {
        clear_env();
        env::set_var("DB_PASSWORD", "hunter2");
        env::set_var("BACKUP_ORDER_OVERRIDES", "app_settings=key, program_speakers = speaker_id");

        let config = Config::from_env().unwrap();
        assert_eq!(config.row_store.order_column_for("companies"), "id");
        assert_eq!(config.row_store.order_column_for("app_settings"), "key");
        assert_eq!(config.row_store.order_column_for("program_speakers"), "speaker_id");
        assert!(config.validate().is_ok());

        env::set_var("BACKUP_ORDER_OVERRIDES", "app_settings");
        assert!(matches!(
            Config::from_env(),
            Err(BackupError::Configuration(_))
        ));

        env::set_var("BACKUP_ORDER_OVERRIDES", "app_settings=key;drop");
        let config = Config::from_env().unwrap();
        assert!(matches!(
            config.validate(),
            Err(BackupError::Configuration(_))
        ));

        clear_env();
    }
}
