//! SQLite backend.
//!
//! Documents are stored as JSON `TEXT` and timestamps as fixed-width RFC 3339
//! `TEXT` (microseconds, `Z`), so lexical order matches time order. Bulk
//! windows stage rows in a temp table with multi-row `INSERT`s.
//!
//! SQLite runs statements in-process, so an attempt the engine abandons is
//! not interrupted: its statement finishes on the connection's worker thread
//! and the transaction rolls back when the connection is next used. The only
//! unbounded wait is on another writer's lock, which `busy_timeout` caps.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};

use super::rows::{overwrite_clause, SessionRow, StagedRow, COLUMNS, MUTABLE_COLUMNS};
use super::with_deadline;
use crate::backend::{BatchLoader, SessionBackend, StagedWindow};
use crate::config::{sqlite_busy_timeout, DatabaseConfig};
use crate::db::{quoted_table_name, sqlite_health_check, validate_identifier};
use crate::error::StoreError;
use crate::models::{ListFilter, SessionRecord, WindowStamp};

const STAGING_TABLE: &str = "temp.session_staging";

/// 14 bound columns per row keeps a chunk well under SQLite's variable limit.
const STAGING_CHUNK_ROWS: usize = 500;

#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    table: String,
    quoted: String,
    op_timeout: Option<Duration>,
    busy_timeout: Duration,
}

impl SqliteBackend {
    pub fn new(
        pool: SqlitePool,
        table: &str,
        op_timeout: Option<Duration>,
    ) -> Result<Self, StoreError> {
        let quoted = quoted_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            quoted,
            op_timeout,
            busy_timeout: sqlite_busy_timeout(op_timeout),
        })
    }

    /// SQLite has no schemas; `config.schema` is validated and otherwise ignored.
    pub fn from_config(pool: SqlitePool, config: &DatabaseConfig) -> Result<Self, StoreError> {
        validate_identifier("schema", &config.schema)?;
        Self::new(pool, &config.table, config.operation_timeout())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn sqlite_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn build_upsert_sql(table: &str, preserve_updated_at: bool) -> String {
    let updated_at = if preserve_updated_at {
        "COALESCE(?, created_at)"
    } else {
        "?"
    };
    format!(
        "INSERT INTO {table} ({COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(session_id) DO UPDATE SET {overwrite}, \
         created_at = COALESCE(created_at, excluded.created_at), \
         updated_at = {updated_at} \
         RETURNING {COLUMNS}",
        overwrite = overwrite_clause(),
    )
}

/// Rewrite an existing row; binds the mutable columns, the write time, then
/// `session_id`.
pub(crate) fn build_update_sql(table: &str) -> String {
    let assignments = MUTABLE_COLUMNS
        .iter()
        .map(|col| format!("{col} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {table} SET {assignments}, updated_at = ? \
         WHERE session_id = ? RETURNING {COLUMNS}"
    )
}

/// Merge staging into `table`, keeping the highest `ord` per `session_id`.
/// Non-preserving merges bind the window's write time.
pub(crate) fn build_merge_sql(table: &str, preserve_updated_at: bool) -> String {
    let updated_at = if preserve_updated_at {
        "excluded.updated_at"
    } else {
        "?"
    };
    format!(
        "INSERT INTO {table} ({COLUMNS}) \
         SELECT {COLUMNS} FROM {STAGING_TABLE} \
         WHERE ord IN (SELECT MAX(ord) FROM {STAGING_TABLE} GROUP BY session_id) \
         ORDER BY ord \
         ON CONFLICT(session_id) DO UPDATE SET {overwrite}, \
         created_at = COALESCE(created_at, excluded.created_at), \
         updated_at = {updated_at}",
        overwrite = overwrite_clause(),
    )
}

#[async_trait]
impl SessionBackend for SqliteBackend {
    async fn upsert_one(
        &self,
        record: &SessionRecord,
        preserve_updated_at: bool,
    ) -> Result<SessionRecord, StoreError> {
        record.validate()?;
        let sql = build_upsert_sql(&self.quoted, preserve_updated_at);
        let now = Utc::now();
        let updated_on_conflict = if preserve_updated_at {
            record.updated_at.map(sqlite_timestamp)
        } else {
            Some(sqlite_timestamp(now))
        };

        with_deadline(self.op_timeout, async {
            let row = sqlx::query_as::<_, SessionRow>(&sql)
                .bind(&record.session_id)
                .bind(&record.agent_id)
                .bind(&record.team_id)
                .bind(&record.workflow_id)
                .bind(&record.user_id)
                .bind(&record.name)
                .bind(Json(&record.metadata))
                .bind(Json(&record.state))
                .bind(Json(&record.agent_data))
                .bind(Json(&record.runs))
                .bind(record.summary.as_ref().map(Json))
                .bind(sqlite_timestamp(record.created_at.unwrap_or(now)))
                .bind(sqlite_timestamp(record.updated_at.unwrap_or(now)))
                .bind(updated_on_conflict)
                .fetch_one(&self.pool)
                .await?;
            row.into_record()
        })
        .await
    }

    async fn update(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError> {
        record.validate()?;
        let sql = build_update_sql(&self.quoted);

        with_deadline(self.op_timeout, async {
            sqlx::query_as::<_, SessionRow>(&sql)
                .bind(&record.agent_id)
                .bind(&record.team_id)
                .bind(&record.workflow_id)
                .bind(&record.user_id)
                .bind(&record.name)
                .bind(Json(&record.metadata))
                .bind(Json(&record.state))
                .bind(Json(&record.agent_data))
                .bind(Json(&record.runs))
                .bind(record.summary.as_ref().map(Json))
                .bind(sqlite_timestamp(Utc::now()))
                .bind(&record.session_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(record.session_id.clone()))?
                .into_record()
        })
        .await
    }

    async fn get(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE session_id = ?", self.quoted);
        with_deadline(self.op_timeout, async {
            sqlx::query_as::<_, SessionRow>(&sql)
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?
                .into_record()
        })
        .await
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<SessionRecord>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM {}", self.quoted));
        for (i, (field, value)) in filter.conditions().enumerate() {
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            qb.push(field.column());
            qb.push(" = ");
            qb.push_bind(value.to_string());
        }
        let order = filter.order.sql();
        qb.push(format!(" ORDER BY updated_at {order}, session_id {order}"));
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::from(limit));
        }

        with_deadline(self.op_timeout, async {
            let mut rows = qb.build_query_as::<SessionRow>().fetch(&self.pool);
            let mut sessions = Vec::new();
            while let Some(row) = rows.try_next().await? {
                sessions.push(row.into_record()?);
            }
            Ok(sessions)
        })
        .await
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {} WHERE session_id = ?", self.quoted);
        with_deadline(self.op_timeout, async {
            let result = sqlx::query(&sql)
                .bind(session_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(session_id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let table = &self.quoted;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    session_id TEXT PRIMARY KEY,
                    agent_id TEXT,
                    team_id TEXT,
                    workflow_id TEXT,
                    user_id TEXT,
                    name TEXT,
                    metadata TEXT,
                    state TEXT,
                    agent_data TEXT,
                    runs TEXT,
                    summary TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "{0}_agent_id_idx" ON {table} (agent_id)"#,
                self.table
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "{0}_user_id_idx" ON {table} (user_id)"#,
                self.table
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "{0}_updated_at_idx" ON {table} (updated_at)"#,
                self.table
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!(table = %table, "Session schema ready");
        Ok(())
    }

    async fn health_check(&self) -> Result<String, StoreError> {
        Ok(sqlite_health_check(&self.pool).await?)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[async_trait]
impl BatchLoader for SqliteBackend {
    async fn begin(
        &self,
        deadline: Option<Duration>,
    ) -> Result<Box<dyn StagedWindow>, StoreError> {
        if deadline.is_some_and(|d| d < self.busy_timeout) {
            tracing::debug!(
                busy_timeout_ms = self.busy_timeout.as_millis() as u64,
                "SQLite lock waits may outlive the attempt deadline"
            );
        }
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteStagedWindow {
            tx,
            table: self.quoted.clone(),
        }))
    }
}

struct SqliteStagedWindow {
    tx: Transaction<'static, Sqlite>,
    table: String,
}

#[async_trait]
impl StagedWindow for SqliteStagedWindow {
    async fn create_staging(&mut self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TEMP TABLE IF NOT EXISTS session_staging (
                ord INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                agent_id TEXT,
                team_id TEXT,
                workflow_id TEXT,
                user_id TEXT,
                name TEXT,
                metadata TEXT,
                state TEXT,
                agent_data TEXT,
                runs TEXT,
                summary TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&mut *self.tx)
        .await?;
        sqlx::query(&format!("DELETE FROM {STAGING_TABLE}"))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn bulk_load(
        &mut self,
        rows: &[SessionRecord],
        stamp: &WindowStamp,
    ) -> Result<u64, StoreError> {
        let staged = StagedRow::encode_all(rows, stamp)?;

        let mut loaded = 0;
        for chunk in staged.chunks(STAGING_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO {STAGING_TABLE} (ord, {COLUMNS}) "));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.ord)
                    .push_bind(row.session_id.as_str())
                    .push_bind(row.agent_id.as_deref())
                    .push_bind(row.team_id.as_deref())
                    .push_bind(row.workflow_id.as_deref())
                    .push_bind(row.user_id.as_deref())
                    .push_bind(row.name.as_deref())
                    .push_bind(row.metadata.as_str())
                    .push_bind(row.state.as_str())
                    .push_bind(row.agent_data.as_str())
                    .push_bind(row.runs.as_str())
                    .push_bind(row.summary.as_deref())
                    .push_bind(sqlite_timestamp(row.created_at))
                    .push_bind(sqlite_timestamp(row.updated_at));
            });
            loaded += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }

        tracing::debug!(rows = loaded, "Staged window via multi-row insert");
        Ok(loaded)
    }

    async fn merge(&mut self, stamp: &WindowStamp) -> Result<u64, StoreError> {
        let sql = build_merge_sql(&self.table, stamp.preserve_updated_at);
        let mut query = sqlx::query(&sql);
        if !stamp.preserve_updated_at {
            query = query.bind(sqlite_timestamp(stamp.write_time));
        }
        let result = query.execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {STAGING_TABLE}"))
            .execute(&mut *self.tx)
            .await?;
        self.tx.commit().await.map_err(StoreError::Commit)
    }

    async fn cleanup(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
