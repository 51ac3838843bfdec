use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::{BatchLoader, SessionBackend};
use crate::backends::{MemoryBackend, PostgresBackend, SqliteBackend};
use crate::config::{BackendKind, BatchConfig, StoreConfig};
use crate::db::{create_pg_pool, create_sqlite_pool};
use crate::engine::{BulkUpsertEngine, BulkUpsertReport};
use crate::error::StoreError;
use crate::models::{ListFilter, SessionRecord};

/// Session store handle: single-record operations go straight to the
/// backend, bulk upserts go through the adaptive engine.
///
/// Cloning is cheap and clones share the same pool.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn SessionBackend>,
    loader: Arc<dyn BatchLoader>,
    engine: BulkUpsertEngine,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.backend.name())
            .field("batch", self.engine.config())
            .finish()
    }
}

impl Store {
    pub fn from_backend<B>(backend: B, batch: BatchConfig) -> Self
    where
        B: SessionBackend + BatchLoader + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            backend: backend.clone(),
            loader: backend,
            engine: BulkUpsertEngine::new(batch),
        }
    }

    pub fn memory(batch: BatchConfig) -> Self {
        Self::from_backend(MemoryBackend::new(), batch)
    }

    /// Validate `config` and open the configured backend. Does not create the
    /// schema; call [`Store::ensure_schema`] for that.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let db = &config.database;

        let store = match db.backend {
            BackendKind::Postgres => {
                let pool = create_pg_pool(db).await?;
                Self::from_backend(
                    PostgresBackend::from_config(pool, db)?,
                    config.batch.clone(),
                )
            }
            BackendKind::Sqlite => {
                let pool = create_sqlite_pool(db).await?;
                Self::from_backend(SqliteBackend::from_config(pool, db)?, config.batch.clone())
            }
            BackendKind::Memory => Self::memory(config.batch.clone()),
        };

        tracing::info!(
            backend = store.backend_name(),
            table = %db.table,
            batch_size = store.engine.config().batch_size,
            "Session store connected"
        );
        Ok(store)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn batch_config(&self) -> &BatchConfig {
        self.engine.config()
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.backend.ensure_schema().await
    }

    pub async fn health_check(&self) -> Result<String, StoreError> {
        self.backend.health_check().await
    }

    pub async fn upsert_one(
        &self,
        record: &SessionRecord,
        preserve_updated_at: bool,
    ) -> Result<SessionRecord, StoreError> {
        self.backend.upsert_one(record, preserve_updated_at).await
    }

    pub async fn upsert_many(
        &self,
        records: &[SessionRecord],
        preserve_updated_at: bool,
    ) -> Result<BulkUpsertReport, StoreError> {
        self.engine
            .upsert_many(self.loader.as_ref(), records, preserve_updated_at)
            .await
    }

    pub async fn upsert_many_cancellable(
        &self,
        records: &[SessionRecord],
        preserve_updated_at: bool,
        cancel: &CancellationToken,
    ) -> Result<BulkUpsertReport, StoreError> {
        self.engine
            .upsert_many_cancellable(self.loader.as_ref(), records, preserve_updated_at, cancel)
            .await
    }

    /// Rewrite an existing session; `NotFound` if it was never stored.
    pub async fn update(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError> {
        self.backend.update(record).await
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        self.backend.get(session_id).await
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<SessionRecord>, StoreError> {
        self.backend.list(filter).await
    }

    pub async fn list_by_agent(&self, agent_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        self.list(&ListFilter::by_agent(agent_id)).await
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        self.list(&ListFilter::by_user(user_id)).await
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.backend.delete(session_id).await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.backend.close().await
    }
}

/// Named stores for callers that serve several databases.
#[derive(Debug, Clone)]
pub struct StoreRegistry {
    stores: HashMap<String, Store>,
    default_name: String,
    default: Store,
}

impl StoreRegistry {
    /// `default` names the store returned by [`StoreRegistry::default_store`];
    /// when `None` the first entry is the default.
    pub fn new(stores: Vec<(String, Store)>, default: Option<&str>) -> Result<Self, StoreError> {
        let default_name = match (default, stores.first()) {
            (_, None) => {
                return Err(StoreError::Config(
                    "store registry needs at least one store".into(),
                ))
            }
            (Some(name), _) => name.to_string(),
            (None, Some((name, _))) => name.clone(),
        };

        let stores: HashMap<String, Store> = stores.into_iter().collect();
        let default = stores.get(&default_name).cloned().ok_or_else(|| {
            StoreError::Config(format!("default store '{default_name}' is not registered"))
        })?;

        Ok(Self {
            stores,
            default_name,
            default,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Store> {
        self.stores.get(name)
    }

    pub fn default_store(&self) -> &Store {
        &self.default
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    /// Close every store, even after a failure. Returns the first error.
    pub async fn close_all(&self) -> Result<(), StoreError> {
        let mut first_err = None;
        for (name, store) in &self.stores {
            tracing::debug!(store = %name, "Closing session store");
            if let Err(e) = store.close().await {
                tracing::warn!(store = %name, error = %e, "Failed to close session store");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
