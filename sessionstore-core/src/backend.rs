//! Storage seams.
//!
//! - [`SessionBackend`]: single-record upsert plus update/get/list/delete.
//! - [`BatchLoader`]: opens one [`StagedWindow`] per bulk window; the
//!   window owns a transaction from `begin` until `commit` or `cleanup`.
//!   `begin` receives the attempt deadline so a backend can bound work the
//!   database keeps doing after the client has abandoned the attempt.
//!
//! The bulk engine only ever talks to these traits.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{ListFilter, SessionRecord, WindowStamp};

/// Row-level session persistence.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Insert-or-update one record and return the row as stored.
    async fn upsert_one(
        &self,
        record: &SessionRecord,
        preserve_updated_at: bool,
    ) -> Result<SessionRecord, StoreError>;

    /// Rewrite an existing row. `created_at` stays as stored and
    /// `updated_at` becomes the write time. `NotFound` when no row matches.
    async fn update(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError>;

    async fn get(&self, session_id: &str) -> Result<SessionRecord, StoreError>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<SessionRecord>, StoreError>;

    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;

    /// Create the sessions table and its indexes if absent.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Round-trip to the database; returns its version string.
    async fn health_check(&self) -> Result<String, StoreError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Opens transactional staging windows for the bulk engine.
#[async_trait]
pub trait BatchLoader: Send + Sync {
    /// Open a window. `deadline` is the attempt budget; `None` means the
    /// attempt is unbounded.
    async fn begin(
        &self,
        deadline: Option<Duration>,
    ) -> Result<Box<dyn StagedWindow>, StoreError>;
}

/// One all-or-nothing unit of bulk work.
///
/// Dropping a window without calling `commit` must discard everything it
/// staged or merged.
#[async_trait]
pub trait StagedWindow: Send {
    async fn create_staging(&mut self) -> Result<(), StoreError>;

    /// Load every row of the window into staging. Returns rows staged.
    async fn bulk_load(
        &mut self,
        rows: &[SessionRecord],
        stamp: &WindowStamp,
    ) -> Result<u64, StoreError>;

    /// Merge staging into the permanent table. Returns rows affected.
    async fn merge(&mut self, stamp: &WindowStamp) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard the window.
    async fn cleanup(self: Box<Self>) -> Result<(), StoreError>;
}

/// Run one window through create → load → merge → commit.
///
/// Any failure before commit rolls the window back, so either every row of
/// `rows` is persisted or none is.
pub async fn write_window(
    loader: &dyn BatchLoader,
    rows: &[SessionRecord],
    preserve_updated_at: bool,
    deadline: Option<Duration>,
) -> Result<u64, StoreError> {
    let stamp = WindowStamp::now(preserve_updated_at);
    let mut window = loader.begin(deadline).await?;

    let staged = async {
        window.create_staging().await?;
        window.bulk_load(rows, &stamp).await?;
        window.merge(&stamp).await
    }
    .await;

    match staged {
        Ok(merged) => {
            window.commit().await?;
            Ok(merged)
        }
        Err(e) => {
            if let Err(cleanup_err) = window.cleanup().await {
                tracing::warn!(error = %cleanup_err, "Failed to roll back staged window");
            }
            Err(e)
        }
    }
}
