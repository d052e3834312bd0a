use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{BulkWriteResult, CatalogStore, StoreError, StoreResult, WriteOp};
use crate::entity::Entity;

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<String, Entity>,
    bulk_writes: u64,
}

/// In-memory catalog store for tests and dry runs.
///
/// Clones share the same records, so a test can hand one clone to a driver
/// and inspect the other afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records ordered by id.
    pub async fn records(&self) -> Vec<Entity> {
        let inner = self.inner.lock().await;
        inner.records.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of bulk writes applied so far.
    pub async fn bulk_writes(&self) -> u64 {
        self.inner.lock().await.bulk_writes
    }
}

impl CatalogStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn reset(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.records.clear();
        Ok(())
    }

    async fn insert_many(&self, entities: Vec<Entity>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut seen = HashSet::with_capacity(entities.len());
        if let Some(dup) = entities
            .iter()
            .find(|e| inner.records.contains_key(&e.id) || !seen.insert(e.id.as_str()))
        {
            return Err(StoreError::DuplicateId(dup.id.clone()));
        }

        let inserted = entities.len() as u64;
        inner
            .records
            .extend(entities.into_iter().map(|e| (e.id.clone(), e)));
        Ok(inserted)
    }

    async fn bulk_write(&self, ops: &[WriteOp]) -> StoreResult<BulkWriteResult> {
        let mut inner = self.inner.lock().await;
        let mut result = BulkWriteResult::default();
        for op in ops {
            match op {
                WriteOp::Upsert(entity) => match inner.records.get_mut(&entity.id) {
                    Some(existing) => {
                        result.matched += 1;
                        if existing != entity {
                            *existing = entity.clone();
                            result.modified += 1;
                        }
                    }
                    None => {
                        inner.records.insert(entity.id.clone(), entity.clone());
                        result.upserted += 1;
                    }
                },
                WriteOp::Delete { id } => {
                    if inner.records.remove(id).is_some() {
                        result.deleted += 1;
                    }
                }
            }
        }
        inner.bulk_writes += 1;
        Ok(result)
    }

    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.records.keys().cloned().collect())
    }

    async fn find(&self, id: &str) -> StoreResult<Option<Entity>> {
        let inner = self.inner.lock().await;
        Ok(inner.records.get(id).cloned())
    }
}
