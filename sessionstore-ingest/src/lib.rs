//! Bulk-import drivers on top of [`Store::upsert_many`]: NDJSON files of
//! session records and synthetic sessions for throughput checks.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use sessionstore_core::{BulkUpsertReport, CancellationToken, SessionRecord, Store, StoreError};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid session record on line {line}: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Records handed to the engine per `upsert_many` call.
    pub chunk_size: usize,
    pub preserve_updated_at: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            preserve_updated_at: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub lines: usize,
    pub records: usize,
    pub windows: usize,
    pub attempts: usize,
    pub shrinks: usize,
    pub elapsed: Duration,
}

impl ImportSummary {
    fn absorb(&mut self, report: &BulkUpsertReport) {
        self.records += report.records;
        self.windows += report.windows;
        self.attempts += report.attempts;
        self.shrinks += report.shrinks;
    }

    pub fn records_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.records as f64 / secs
        } else {
            self.records as f64
        }
    }
}

/// Stream an NDJSON file (one `SessionRecord` per line) into `store`.
///
/// Blank lines are skipped. A malformed line aborts the import; chunks
/// already handed to the store stay committed.
pub async fn import_ndjson(
    store: &Store,
    path: &Path,
    opts: &ImportOptions,
) -> Result<ImportSummary, IngestError> {
    import_ndjson_cancellable(store, path, opts, &CancellationToken::new()).await
}

/// [`import_ndjson`] that stops at the next window boundary once `cancel`
/// fires. Windows committed before that point are kept.
pub async fn import_ndjson_cancellable(
    store: &Store,
    path: &Path,
    opts: &ImportOptions,
    cancel: &CancellationToken,
) -> Result<ImportSummary, IngestError> {
    let started = Instant::now();
    let chunk_size = opts.chunk_size.max(1);
    let mut lines = BufReader::new(File::open(path).await?).lines();
    let mut summary = ImportSummary::default();
    let mut chunk = Vec::with_capacity(chunk_size);

    while let Some(line) = lines.next_line().await? {
        summary.lines += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: SessionRecord = serde_json::from_str(&line).map_err(|source| {
            IngestError::Decode {
                line: summary.lines,
                source,
            }
        })?;
        chunk.push(record);

        if chunk.len() >= chunk_size {
            flush_chunk(store, &chunk, opts, cancel, &mut summary).await?;
            tracing::debug!(records = summary.records, "Imported chunk");
            chunk.clear();
        }
    }

    if !chunk.is_empty() {
        flush_chunk(store, &chunk, opts, cancel, &mut summary).await?;
    }

    summary.elapsed = started.elapsed();
    tracing::info!(
        path = %path.display(),
        lines = summary.lines,
        records = summary.records,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "NDJSON import complete"
    );
    Ok(summary)
}

async fn flush_chunk(
    store: &Store,
    chunk: &[SessionRecord],
    opts: &ImportOptions,
    cancel: &CancellationToken,
    summary: &mut ImportSummary,
) -> Result<(), IngestError> {
    let report = store
        .upsert_many_cancellable(chunk, opts.preserve_updated_at, cancel)
        .await
        .map_err(|e| {
            if matches!(e, StoreError::Cancelled) {
                tracing::warn!(
                    records = summary.records,
                    "Import cancelled; earlier windows stay committed"
                );
            }
            e
        })?;
    summary.absorb(&report);
    Ok(())
}

/// Fresh sessions with random ids, spread over ten agents and twenty users
/// unless `agent_id` pins them all to one agent.
pub fn synthetic_sessions(count: usize, agent_id: Option<&str>) -> Vec<SessionRecord> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let agent = agent_id
                .map(str::to_string)
                .unwrap_or_else(|| format!("agent-{:03}", i % 10));
            let mut record = SessionRecord::new(Uuid::new_v4().to_string())
                .with_agent(agent)
                .with_user(format!("user-{:03}", i % 20))
                .with_name(format!("Session {}", i + 1));
            record.metadata = json!({
                "source": "seed",
                "batch": true,
                "index": i,
                "created": now.to_rfc3339(),
            });
            record.state = json!({"status": "active"});
            record
        })
        .collect()
}

/// Sessions with historical timestamps, one day apart from `base`, for
/// exercising `preserve_updated_at` imports.
pub fn historical_sessions(count: usize, base: DateTime<Utc>) -> Vec<SessionRecord> {
    (0..count)
        .map(|i| {
            let created_at = base + chrono::Duration::days(i as i64);
            let mut record = SessionRecord::new(format!("migration-session-{i}"))
                .with_agent(format!("legacy-agent-{:03}", i % 5))
                .with_user(format!("legacy-user-{:03}", i % 10))
                .with_name(format!("Historical Session {}", i + 1))
                .with_created_at(created_at)
                .with_updated_at(created_at + chrono::Duration::hours(2));
            record.metadata = json!({"source": "migration", "legacy_id": format!("old-{i}")});
            record
        })
        .collect()
}
