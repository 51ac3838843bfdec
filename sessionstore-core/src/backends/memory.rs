use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::backend::{BatchLoader, SessionBackend, StagedWindow};
use crate::error::StoreError;
use crate::models::timestamps::{insert_stamps, merged_update_stamps, update_stamps};
use crate::models::{ListFilter, SessionRecord, SortOrder, Stamps, WindowStamp};

type Table = HashMap<String, SessionRecord>;

/// Process-local backend for tests and tooling.
///
/// A bulk window holds the table's write lock from `begin` until it is
/// committed or dropped, so readers never observe a half-merged window.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    table: Arc<RwLock<Table>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }
}

fn stamped(mut record: SessionRecord, stamps: Stamps) -> SessionRecord {
    record.created_at = Some(stamps.created_at);
    record.updated_at = Some(stamps.updated_at);
    record
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn upsert_one(
        &self,
        record: &SessionRecord,
        preserve_updated_at: bool,
    ) -> Result<SessionRecord, StoreError> {
        record.validate()?;
        let now = Utc::now();
        let mut table = self.table.write().await;

        let existing_created = table
            .get(&record.session_id)
            .and_then(|stored| stored.created_at);
        let stamps = match existing_created {
            Some(created_at) => update_stamps(created_at, record, preserve_updated_at, now),
            None => insert_stamps(record, now),
        };

        let stored = stamped(record.clone(), stamps);
        table.insert(stored.session_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError> {
        record.validate()?;
        let now = Utc::now();
        let mut table = self.table.write().await;

        let created_at = match table.get(&record.session_id) {
            Some(stored) => stored.created_at.unwrap_or(now),
            None => return Err(StoreError::NotFound(record.session_id.clone())),
        };
        let stored = stamped(record.clone(), update_stamps(created_at, record, false, now));
        table.insert(stored.session_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        self.table
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<SessionRecord>, StoreError> {
        let table = self.table.read().await;
        let mut matches: Vec<SessionRecord> = table
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        if filter.order == SortOrder::Descending {
            matches.reverse();
        }
        if let Some(limit) = filter.limit {
            matches.truncate(limit as usize);
        }
        Ok(matches)
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        match self.table.write().await.remove(session_id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(session_id.to_string())),
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<String, StoreError> {
        Ok(format!("in-memory ({} sessions)", self.len().await))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl BatchLoader for MemoryBackend {
    async fn begin(
        &self,
        _deadline: Option<Duration>,
    ) -> Result<Box<dyn StagedWindow>, StoreError> {
        let guard = Arc::clone(&self.table).write_owned().await;
        Ok(Box::new(MemoryWindow {
            guard,
            staging: None,
            pending: Vec::new(),
        }))
    }
}

struct MemoryWindow {
    guard: OwnedRwLockWriteGuard<Table>,
    staging: Option<Vec<(SessionRecord, Stamps)>>,
    pending: Vec<SessionRecord>,
}

impl MemoryWindow {
    fn staging_mut(&mut self) -> Result<&mut Vec<(SessionRecord, Stamps)>, StoreError> {
        self.staging
            .as_mut()
            .ok_or_else(|| StoreError::Config("staging area used before create_staging".into()))
    }
}

#[async_trait]
impl StagedWindow for MemoryWindow {
    async fn create_staging(&mut self) -> Result<(), StoreError> {
        self.staging = Some(Vec::new());
        Ok(())
    }

    async fn bulk_load(
        &mut self,
        rows: &[SessionRecord],
        stamp: &WindowStamp,
    ) -> Result<u64, StoreError> {
        let staging = self.staging_mut()?;
        staging.extend(rows.iter().map(|r| (r.clone(), stamp.staged(r))));
        Ok(rows.len() as u64)
    }

    async fn merge(&mut self, _stamp: &WindowStamp) -> Result<u64, StoreError> {
        let staged = std::mem::take(self.staging_mut()?);

        // Last occurrence of a session_id wins.
        let mut latest: HashMap<String, (SessionRecord, Stamps)> = HashMap::new();
        let mut order = Vec::new();
        for (record, stamps) in staged {
            if !latest.contains_key(&record.session_id) {
                order.push(record.session_id.clone());
            }
            latest.insert(record.session_id.clone(), (record, stamps));
        }

        let mut pending = Vec::with_capacity(order.len());
        for id in order {
            let Some((record, staged_stamps)) = latest.remove(&id) else {
                continue;
            };
            let stamps = match self.guard.get(&id).and_then(|stored| stored.created_at) {
                Some(created_at) => merged_update_stamps(created_at, staged_stamps),
                None => staged_stamps,
            };
            pending.push(stamped(record, stamps));
        }

        let merged = pending.len() as u64;
        self.pending = pending;
        Ok(merged)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        for record in std::mem::take(&mut self.pending) {
            self.guard.insert(record.session_id.clone(), record);
        }
        Ok(())
    }

    async fn cleanup(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
