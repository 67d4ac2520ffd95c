use super::{Row, RowStore};
use crate::config::DatabaseConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use std::time::Duration;
use tracing::{debug, info};

const UNDEFINED_TABLE: &str = "42P01";

/// Row store backed by a direct PostgreSQL connection.
#[derive(Debug, Clone)]
pub struct PostgresRowStore {
    pool: PgPool,
    host: String,
    database: String,
}

impl PostgresRowStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.name)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(if config.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect_with(options)
            .await?;

        // Test the connection
        sqlx::query("SELECT 1").execute(&pool).await?;

        info!(
            "Connected to PostgreSQL at {}:{}/{}",
            config.host, config.port, config.name
        );

        Ok(Self::from_pool(pool, &config.host, &config.name))
    }

    pub fn from_pool(pool: PgPool, host: &str, database: &str) -> Self {
        Self {
            pool,
            host: host.to_string(),
            database: database.to_string(),
        }
    }

    fn map_error(table: &str, error: sqlx::Error) -> BackupError {
        if let sqlx::Error::Database(db_error) = &error {
            if db_error.code().as_deref() == Some(UNDEFINED_TABLE) {
                return BackupError::TableNotFound {
                    table: table.to_string(),
                };
            }
        }
        BackupError::table_access(table, error.to_string())
    }
}

/// Double-quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// One paginated read. `ctid` keeps page boundaries stable while nothing is
/// being vacuumed; rows changing mid-read are an accepted limitation.
pub fn select_page_statement(table: &str) -> String {
    format!(
        "SELECT to_jsonb(t) AS row FROM {} AS t ORDER BY t.ctid LIMIT $1 OFFSET $2",
        quote_ident(table)
    )
}

/// Multi-row insert of a JSON array of rows; existing rows are left alone.
pub fn insert_statement(table: &str) -> String {
    let table = quote_ident(table);
    format!(
        "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1) \
         ON CONFLICT DO NOTHING"
    )
}

#[async_trait]
impl RowStore for PostgresRowStore {
    fn describe(&self) -> String {
        format!("postgres://{}/{}", self.host, self.database)
    }

    async fn select_page(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<Row>> {
        let values: Vec<serde_json::Value> = sqlx::query_scalar(&select_page_statement(table))
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::map_error(table, e))?;

        values
            .into_iter()
            .map(|value| match value {
                serde_json::Value::Object(row) => Ok(row),
                other => Err(BackupError::table_access(
                    table,
                    format!("expected a JSON object per row, got {other}"),
                )),
            })
            .collect()
    }

    async fn insert_missing(&self, table: &str, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let payload = serde_json::Value::Array(
            rows.iter()
                .cloned()
                .map(serde_json::Value::Object)
                .collect(),
        );

        let result = sqlx::query(&insert_statement(table))
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_error(table, e))?;

        debug!(
            "Inserted {} of {} rows into {}",
            result.rows_affected(),
            rows.len(),
            table
        );
        Ok(result.rows_affected())
    }

    async fn execute_script(&self, script: &str) -> Result<()> {
        sqlx::raw_sql(script)
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::table_access("<sql dump>", e.to_string()))?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Option<Vec<String>>> {
        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(tables))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("companies"), "\"companies\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_insert_statement_skips_conflicts() {
        let sql = insert_statement("booths");
        assert!(sql.starts_with("INSERT INTO \"booths\""));
        assert!(sql.contains("jsonb_populate_recordset(NULL::\"booths\", $1)"));
        assert!(sql.ends_with("ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn test_select_page_statement_is_paginated() {
        let sql = select_page_statement("events");
        assert!(sql.contains("FROM \"events\" AS t"));
        assert!(sql.contains("LIMIT $1 OFFSET $2"));
    }
}
