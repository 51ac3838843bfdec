use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};

use crate::config::DatabaseConfig;
use crate::error::StoreError;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static identifier regex"))
}

/// Reject schema/table names that could smuggle SQL into generated DDL/DML.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), StoreError> {
    if value.is_empty() {
        return Err(StoreError::Config(format!("{kind} name cannot be empty")));
    }
    if !identifier_pattern().is_match(value) {
        return Err(StoreError::Config(format!("invalid {kind} name: {value}")));
    }
    Ok(())
}

/// `"schema"."table"` after validating both parts.
pub fn qualified_table_name(schema: &str, table: &str) -> Result<String, StoreError> {
    validate_identifier("schema", schema)?;
    validate_identifier("table", table)?;
    Ok(format!(r#""{schema}"."{table}""#))
}

/// `"table"` after validation, for backends without schemas.
pub fn quoted_table_name(table: &str) -> Result<String, StoreError> {
    validate_identifier("table", table)?;
    Ok(format!(r#""{table}""#))
}

/// Connections carry `statement_timeout` from the operation timeout, so a
/// single-record statement the client stopped waiting on is cancelled by the
/// server as well. Bulk windows override it per transaction.
pub async fn create_pg_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let mut options = PgConnectOptions::from_str(&config.url)?;
    if let Some(timeout) = config.operation_timeout() {
        options = options.options([("statement_timeout", timeout.as_millis())]);
    }
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
}

pub async fn create_sqlite_pool(config: &DatabaseConfig) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");
    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .busy_timeout(config.sqlite_busy_timeout());
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // Every connection to an in-memory database opens a private database.
    let max_connections = if in_memory { 1 } else { config.max_connections };

    let mut pool = SqlitePoolOptions::new().max_connections(max_connections);
    if in_memory {
        pool = pool.idle_timeout(None).max_lifetime(None);
    }
    pool.connect_with(options).await
}

pub async fn pg_health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

pub async fn sqlite_health_check(pool: &SqlitePool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT sqlite_version()")
        .fetch_one(pool)
        .await?;
    Ok(format!("SQLite {}", row.0))
}
