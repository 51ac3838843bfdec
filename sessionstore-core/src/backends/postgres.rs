//! PostgreSQL backend.
//!
//! Single-record upserts are one `INSERT … ON CONFLICT … RETURNING` statement.
//! Bulk windows load a transaction-scoped temp table with `COPY … FROM STDIN`
//! (text format) and merge it into the sessions table in one statement.
//!
//! Each window transaction carries `statement_timeout` and `lock_timeout`
//! derived from the attempt deadline. A window the client has given up on is
//! then aborted by the server too, releasing its row locks before the engine
//! retries a smaller window over the same keys.

use std::ops::DerefMut;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use sqlx::postgres::PgCopyIn;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction};

use super::rows::{overwrite_clause, SessionRow, StagedRow, COLUMNS, MUTABLE_COLUMNS};
use super::with_deadline;
use crate::backend::{BatchLoader, SessionBackend, StagedWindow};
use crate::config::DatabaseConfig;
use crate::db::{pg_health_check, qualified_table_name};
use crate::error::StoreError;
use crate::models::{ListFilter, SessionRecord, WindowStamp};

const STAGING_TABLE: &str = "session_staging";

/// Flush the COPY buffer once it grows past this many bytes.
const COPY_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    schema: String,
    table: String,
    qualified: String,
    op_timeout: Option<Duration>,
}

impl PostgresBackend {
    pub fn new(
        pool: PgPool,
        schema: &str,
        table: &str,
        op_timeout: Option<Duration>,
    ) -> Result<Self, StoreError> {
        let qualified = qualified_table_name(schema, table)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
            table: table.to_string(),
            qualified,
            op_timeout,
        })
    }

    pub fn from_config(pool: PgPool, config: &DatabaseConfig) -> Result<Self, StoreError> {
        Self::new(
            pool,
            &config.schema,
            &config.table,
            config.operation_timeout(),
        )
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table_name(&self) -> &str {
        &self.qualified
    }
}

pub(crate) fn build_upsert_sql(table: &str, preserve_updated_at: bool) -> String {
    let updated_at = if preserve_updated_at {
        "COALESCE($14, t.created_at)"
    } else {
        "$14"
    };
    format!(
        "INSERT INTO {table} AS t ({COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         ON CONFLICT (session_id) DO UPDATE SET {overwrite}, \
         created_at = COALESCE(t.created_at, EXCLUDED.created_at), \
         updated_at = {updated_at} \
         RETURNING {COLUMNS}",
        overwrite = overwrite_clause(),
    )
}

/// Rewrite an existing row; `$12` is the write time. `created_at` is left
/// as stored.
pub(crate) fn build_update_sql(table: &str) -> String {
    let assignments = MUTABLE_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{col} = ${}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {table} SET {assignments}, updated_at = ${next} \
         WHERE session_id = $1 RETURNING {COLUMNS}",
        next = MUTABLE_COLUMNS.len() + 2,
    )
}

/// Merge the staging table into `table`, keeping the highest `ord` for each
/// `session_id`. Non-preserving merges bind the window's write time as `$1`.
pub(crate) fn build_merge_sql(table: &str, preserve_updated_at: bool) -> String {
    let updated_at = if preserve_updated_at {
        "EXCLUDED.updated_at"
    } else {
        "$1"
    };
    format!(
        "INSERT INTO {table} AS t ({COLUMNS}) \
         SELECT DISTINCT ON (session_id) {COLUMNS} FROM {STAGING_TABLE} \
         ORDER BY session_id, ord DESC \
         ON CONFLICT (session_id) DO UPDATE SET {overwrite}, \
         created_at = COALESCE(t.created_at, EXCLUDED.created_at), \
         updated_at = {updated_at}",
        overwrite = overwrite_clause(),
    )
}

/// Server-side budget for an attempt. Stays under the client deadline so the
/// server aborts the statement before the client abandons it.
pub(crate) fn server_budget_ms(deadline: Duration) -> u128 {
    (deadline.as_millis() * 9 / 10).max(1)
}

/// `SET LOCAL` statements bounding every statement and lock wait in a window
/// transaction. Without a deadline both are `0`, which also lifts the pool's
/// per-operation `statement_timeout`. `SET` takes no bind parameters; the
/// value is an integer.
pub(crate) fn window_timeout_sql(deadline: Option<Duration>) -> [String; 2] {
    let ms = deadline.map_or(0, server_budget_ms);
    [
        format!("SET LOCAL statement_timeout = {ms}"),
        format!("SET LOCAL lock_timeout = {ms}"),
    ]
}

fn staging_ddl() -> String {
    format!(
        "CREATE TEMPORARY TABLE {STAGING_TABLE} (
            ord BIGINT NOT NULL,
            session_id TEXT NOT NULL,
            agent_id TEXT,
            team_id TEXT,
            workflow_id TEXT,
            user_id TEXT,
            name TEXT,
            metadata JSONB,
            state JSONB,
            agent_data JSONB,
            runs JSONB,
            summary JSONB,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        ) ON COMMIT DROP"
    )
}

fn copy_statement() -> String {
    format!("COPY {STAGING_TABLE} (ord, {COLUMNS}) FROM STDIN")
}

/// Append `value` escaped for COPY text format.
fn push_text(buf: &mut BytesMut, value: &str) {
    for byte in value.bytes() {
        match byte {
            b'\\' => buf.put_slice(b"\\\\"),
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            b'\t' => buf.put_slice(b"\\t"),
            other => buf.put_u8(other),
        }
    }
}

fn push_opt(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(v) => push_text(buf, v),
        None => buf.put_slice(b"\\N"),
    }
}

fn push_timestamp(buf: &mut BytesMut, ts: &DateTime<Utc>) {
    buf.put_slice(ts.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
}

fn write_copy_row(buf: &mut BytesMut, row: &StagedRow) {
    buf.put_slice(row.ord.to_string().as_bytes());
    for field in [
        Some(row.session_id.as_str()),
        row.agent_id.as_deref(),
        row.team_id.as_deref(),
        row.workflow_id.as_deref(),
        row.user_id.as_deref(),
        row.name.as_deref(),
        Some(row.metadata.as_str()),
        Some(row.state.as_str()),
        Some(row.agent_data.as_str()),
        Some(row.runs.as_str()),
        row.summary.as_deref(),
    ] {
        buf.put_u8(b'\t');
        push_opt(buf, field);
    }
    buf.put_u8(b'\t');
    push_timestamp(buf, &row.created_at);
    buf.put_u8(b'\t');
    push_timestamp(buf, &row.updated_at);
    buf.put_u8(b'\n');
}

async fn send_rows<C>(copy: &mut PgCopyIn<C>, rows: &[StagedRow]) -> Result<(), sqlx::Error>
where
    C: DerefMut<Target = PgConnection>,
{
    let mut buf = BytesMut::with_capacity(COPY_CHUNK_BYTES);
    for row in rows {
        write_copy_row(&mut buf, row);
        if buf.len() >= COPY_CHUNK_BYTES {
            copy.send(buf.split().freeze()).await?;
        }
    }
    if !buf.is_empty() {
        copy.send(buf.freeze()).await?;
    }
    Ok(())
}

#[async_trait]
impl SessionBackend for PostgresBackend {
    async fn upsert_one(
        &self,
        record: &SessionRecord,
        preserve_updated_at: bool,
    ) -> Result<SessionRecord, StoreError> {
        record.validate()?;
        let sql = build_upsert_sql(&self.qualified, preserve_updated_at);
        let now = Utc::now();
        let updated_on_conflict = if preserve_updated_at {
            record.updated_at
        } else {
            Some(now)
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
                .bind(record.created_at.unwrap_or(now))
                .bind(record.updated_at.unwrap_or(now))
                .bind(updated_on_conflict)
                .fetch_one(&self.pool)
                .await?;
            row.into_record()
        })
        .await
    }

    async fn update(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError> {
        record.validate()?;
        let sql = build_update_sql(&self.qualified);

        with_deadline(self.op_timeout, async {
            sqlx::query_as::<_, SessionRow>(&sql)
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
                .bind(Utc::now())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(record.session_id.clone()))?
                .into_record()
        })
        .await
    }

    async fn get(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE session_id = $1",
            self.qualified
        );
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
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM {}", self.qualified));
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
        let sql = format!("DELETE FROM {} WHERE session_id = $1", self.qualified);
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
        let table = &self.qualified;
        let statements = [
            format!(r#"CREATE SCHEMA IF NOT EXISTS "{}""#, self.schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    session_id TEXT PRIMARY KEY,
                    agent_id TEXT,
                    team_id TEXT,
                    workflow_id TEXT,
                    user_id TEXT,
                    name TEXT,
                    metadata JSONB,
                    state JSONB,
                    agent_data JSONB,
                    runs JSONB,
                    summary JSONB,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
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
        Ok(pg_health_check(&self.pool).await?)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

#[async_trait]
impl BatchLoader for PostgresBackend {
    async fn begin(
        &self,
        deadline: Option<Duration>,
    ) -> Result<Box<dyn StagedWindow>, StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in &window_timeout_sql(deadline) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        Ok(Box::new(PgStagedWindow {
            tx,
            table: self.qualified.clone(),
        }))
    }
}

struct PgStagedWindow {
    tx: Transaction<'static, Postgres>,
    table: String,
}

#[async_trait]
impl StagedWindow for PgStagedWindow {
    async fn create_staging(&mut self) -> Result<(), StoreError> {
        sqlx::query(&staging_ddl()).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn bulk_load(
        &mut self,
        rows: &[SessionRecord],
        stamp: &WindowStamp,
    ) -> Result<u64, StoreError> {
        let staged = StagedRow::encode_all(rows, stamp)?;

        let mut copy = self.tx.copy_in_raw(&copy_statement()).await?;
        if let Err(e) = send_rows(&mut copy, &staged).await {
            if let Err(abort_err) = copy.abort(e.to_string()).await {
                tracing::debug!(error = %abort_err, "COPY abort reported an error");
            }
            return Err(e.into());
        }
        let loaded = copy.finish().await?;

        tracing::debug!(rows = loaded, "Staged window via COPY");
        Ok(loaded)
    }

    async fn merge(&mut self, stamp: &WindowStamp) -> Result<u64, StoreError> {
        let sql = build_merge_sql(&self.table, stamp.preserve_updated_at);
        let mut query = sqlx::query(&sql);
        if !stamp.preserve_updated_at {
            query = query.bind(stamp.write_time);
        }
        let result = query.execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(StoreError::Commit)
    }

    async fn cleanup(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
