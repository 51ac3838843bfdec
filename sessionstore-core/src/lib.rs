pub mod backend;
pub mod backends;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod store;

pub use backend::{write_window, BatchLoader, SessionBackend, StagedWindow};
pub use backends::{MemoryBackend, PostgresBackend, SqliteBackend};
pub use config::{BackendKind, BatchConfig, DatabaseConfig, LoggingConfig, StoreConfig};
pub use engine::{BulkUpsertEngine, BulkUpsertReport, WindowState};
pub use error::StoreError;
pub use models::{Document, FilterField, ListFilter, SessionRecord, SortOrder};
pub use store::{Store, StoreRegistry};
pub use tokio_util::sync::CancellationToken;
