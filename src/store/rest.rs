use super::{Row, RowStore};
use crate::config::RowStoreConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Error codes the hosted REST layer uses for a missing relation.
const MISSING_TABLE_CODES: &[&str] = &["42P01", "PGRST205"];

/// Row store backed by the hosted service's REST endpoint.
#[derive(Debug, Clone)]
pub struct RestRowStore {
    client: Client,
    base_url: url::Url,
    api_key: String,
    order_column: String,
    order_overrides: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RestErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RestRowStore {
    pub fn new(config: &RowStoreConfig) -> Result<Self> {
        let raw_url = config.url.as_deref().ok_or_else(|| {
            BackupError::Configuration("SUPABASE_URL is not set".to_string())
        })?;
        let base_url = url::Url::parse(raw_url)
            .map_err(|e| BackupError::Configuration(format!("Invalid SUPABASE_URL: {e}")))?;
        let api_key = config.api_key.clone().ok_or_else(|| {
            BackupError::Configuration("No row-store API key configured".to_string())
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key,
            order_column: config.order_column.clone(),
            order_overrides: config.order_overrides.clone(),
        })
    }

    fn table_url(&self, table: &str) -> Result<url::Url> {
        self.base_url
            .join(&format!("rest/v1/{table}"))
            .map_err(|e| BackupError::table_access(table, format!("bad endpoint URL: {e}")))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    /// Query for one page. Pages are ordered on a key so that separately
    /// planned requests agree on row positions.
    fn page_query(&self, table: &str, offset: usize, limit: usize) -> Vec<(&'static str, String)> {
        let column = self
            .order_overrides
            .get(table)
            .unwrap_or(&self.order_column);
        vec![
            ("select", "*".to_string()),
            ("order", format!("{column}.asc")),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ]
    }

    /// Turn a non-success response into the matching error.
    async fn error_for(table: &str, response: Response) -> BackupError {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Self::classify_error(table, status, &text)
    }

    fn classify_error(table: &str, status: StatusCode, text: &str) -> BackupError {
        let body: Option<RestErrorBody> = serde_json::from_str(text).ok();

        let missing = body
            .as_ref()
            .and_then(|b| b.code.as_deref())
            .map(|code| MISSING_TABLE_CODES.contains(&code))
            .unwrap_or(false);
        if missing || (status == StatusCode::NOT_FOUND && body.is_none()) {
            return BackupError::TableNotFound {
                table: table.to_string(),
            };
        }

        let message = body
            .and_then(|b| b.message)
            .unwrap_or_else(|| text.to_string());
        BackupError::table_access(table, format!("status {status}: {message}"))
    }

    fn is_transient(error: &BackupError) -> bool {
        match error {
            BackupError::Http(e) => e.is_timeout() || e.is_connect(),
            BackupError::TableAccess { message, .. } => {
                message.starts_with("status 5") || message.starts_with("status 429")
            }
            _ => false,
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let op = || {
            let attempt = operation();
            async move {
                attempt.await.map_err(|e| {
                    if Self::is_transient(&e) {
                        warn!("Row-store request failed, will retry: {}", e);
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        };

        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        retry(backoff, op).await
    }

    async fn fetch_page(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<Row>> {
        let url = self.table_url(table)?;
        let response = self
            .authorize(self.client.get(url))
            .query(&self.page_query(table, offset, limit))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(table, response).await);
        }

        Ok(response.json::<Vec<Row>>().await?)
    }

    async fn post_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        let url = self.table_url(table)?;
        let response = self
            .authorize(self.client.post(url))
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(rows)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(table, response).await);
        }

        // Only newly inserted rows are echoed back.
        let inserted = response.json::<Vec<serde_json::Value>>().await?;
        Ok(inserted.len() as u64)
    }
}

#[async_trait]
impl RowStore for RestRowStore {
    fn describe(&self) -> String {
        format!(
            "rest://{}",
            self.base_url.host_str().unwrap_or("unknown-host")
        )
    }

    async fn select_page(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<Row>> {
        self.with_retry(|| self.fetch_page(table, offset, limit))
            .await
    }

    async fn insert_missing(&self, table: &str, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let inserted = self.with_retry(|| self.post_rows(table, rows)).await?;
        debug!("Inserted {} of {} rows into {}", inserted, rows.len(), table);
        Ok(inserted)
    }

    async fn execute_script(&self, _script: &str) -> Result<()> {
        Err(BackupError::table_access(
            "<sql dump>",
            "SQL dumps can only be replayed with ROW_STORE_BACKEND=postgres",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RowStoreBackend;

    fn rest_config() -> RowStoreConfig {
        RowStoreConfig {
            backend: RowStoreBackend::Rest,
            url: Some("https://abc.example.co".to_string()),
            api_key: Some("service-key".to_string()),
            ..RowStoreConfig::default()
        }
    }

    #[test]
    fn test_table_url() {
        let store = RestRowStore::new(&rest_config()).unwrap();
        assert_eq!(
            store.table_url("companies").unwrap().as_str(),
            "https://abc.example.co/rest/v1/companies"
        );
        assert_eq!(store.describe(), "rest://abc.example.co");
    }

    #[test]
    fn test_pages_are_ordered_by_key() {
        let mut config = rest_config();
        config
            .order_overrides
            .insert("app_settings".to_string(), "key".to_string());
        let store = RestRowStore::new(&config).unwrap();

        assert_eq!(
            store.page_query("companies", 1000, 1000),
            vec![
                ("select", "*".to_string()),
                ("order", "id.asc".to_string()),
                ("offset", "1000".to_string()),
                ("limit", "1000".to_string()),
            ]
        );
        assert!(store
            .page_query("app_settings", 0, 50)
            .contains(&("order", "key.asc".to_string())));
    }

    #[test]
    fn test_missing_relation_codes_map_to_table_not_found() {
        for body in [
            r#"{"code":"42P01","message":"relation \"public.booths\" does not exist"}"#,
            r#"{"code":"PGRST205","message":"Could not find the table 'public.booths'"}"#,
        ] {
            let err = RestRowStore::classify_error("booths", StatusCode::NOT_FOUND, body);
            assert!(
                matches!(err, BackupError::TableNotFound { ref table } if table == "booths"),
                "{body} gave {err:?}"
            );
        }

        // Same codes under a different status still mean the table is missing.
        let err = RestRowStore::classify_error(
            "booths",
            StatusCode::BAD_REQUEST,
            r#"{"code":"42P01","message":"missing"}"#,
        );
        assert!(err.is_table_not_found());
    }

    #[test]
    fn test_bare_404_is_table_not_found() {
        let err = RestRowStore::classify_error("booths", StatusCode::NOT_FOUND, "");
        assert!(err.is_table_not_found());
        let err = RestRowStore::classify_error("booths", StatusCode::NOT_FOUND, "Not Found");
        assert!(err.is_table_not_found());
    }

    #[test]
    fn test_other_failures_are_table_access_errors() {
        let err = RestRowStore::classify_error(
            "companies",
            StatusCode::UNAUTHORIZED,
            r#"{"code":"PGRST301","message":"JWT expired"}"#,
        );
        match err {
            BackupError::TableAccess { table, message } => {
                assert_eq!(table, "companies");
                assert_eq!(message, "status 401 Unauthorized: JWT expired");
            }
            other => panic!("unexpected {other:?}"),
        }

        // A 404 that carries a structured body for something else is not a
        // missing table.
        let err = RestRowStore::classify_error(
            "companies",
            StatusCode::NOT_FOUND,
            r#"{"code":"PGRST116","message":"no rows"}"#,
        );
        assert!(!err.is_table_not_found());

        let err = RestRowStore::classify_error(
            "companies",
            StatusCode::SERVICE_UNAVAILABLE,
            "upstream down",
        );
        assert!(RestRowStore::is_transient(&err));
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let mut config = rest_config();
        config.api_key = None;
        assert!(matches!(
            RestRowStore::new(&config),
            Err(BackupError::Configuration(_))
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(RestRowStore::is_transient(&BackupError::table_access(
            "x",
            "status 503 Service Unavailable: down"
        )));
        assert!(!RestRowStore::is_transient(&BackupError::table_access(
            "x",
            "status 400 Bad Request: nope"
        )));
        assert!(!RestRowStore::is_transient(&BackupError::TableNotFound {
            table: "x".to_string()
        }));
    }
}
