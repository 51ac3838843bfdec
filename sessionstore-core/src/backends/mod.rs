pub mod memory;
pub mod postgres;
mod rows;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Run `op` under an optional deadline; elapsing maps to `StoreError::Timeout`.
pub(crate) async fn with_deadline<T, F>(deadline: Option<Duration>, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match deadline {
        None => op.await,
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .map_err(|_| StoreError::Timeout {
                millis: limit.as_millis() as u64,
            })?,
    }
}
