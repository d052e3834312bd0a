//! Persistent catalog stores.
//!
//! [`CatalogStore`] is the seam between the drivers and whatever holds the
//! catalog. Writes are keyed by entity id: an upsert inserts or overwrites, a
//! delete removes the id if present. Both are idempotent, so a failed bulk
//! write may be replayed as a whole.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::entity::Entity;
use crate::metrics::Metrics;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("duplicate id {0}")]
    DuplicateId(String),
    #[error("price of {cents} cents for id {id} does not fit the store")]
    PriceOutOfRange { id: String, cents: u64 },
    #[error("stored row for id {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One keyed write inside a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert when absent, overwrite every field when present.
    Upsert(Entity),
    Delete { id: String },
}

impl WriteOp {
    pub fn id(&self) -> &str {
        match self {
            WriteOp::Upsert(entity) => &entity.id,
            WriteOp::Delete { id } => id,
        }
    }
}

/// Outcome counts of one bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    /// Upserts that found an existing record.
    pub matched: u64,
    /// Matched upserts whose stored value actually changed.
    pub modified: u64,
    /// Upserts that inserted a new record.
    pub upserted: u64,
    /// Deletes that removed a record.
    pub deleted: u64,
}

impl BulkWriteResult {
    pub fn metrics(&self) -> Metrics {
        Metrics {
            added: self.upserted,
            updated: self.modified,
            deleted: self.deleted,
        }
    }
}

/// Storage backend for the catalog.
///
/// Methods return `Send` futures so both drivers can run against any store
/// from a multi-threaded runtime.
pub trait CatalogStore: Send + Sync {
    /// Returns the name of the store, used in logs.
    fn name(&self) -> &'static str;

    /// Drops every record and recreates an empty catalog. Safe to call on a fresh store.
    fn reset(&self) -> impl Future<Output = StoreResult<()>> + Send;

    /// Inserts new records; fails on an id that already exists.
    fn insert_many(&self, entities: Vec<Entity>) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Applies `ops` in order as one request.
    fn bulk_write(
        &self,
        ops: &[WriteOp],
    ) -> impl Future<Output = StoreResult<BulkWriteResult>> + Send;

    /// Ids of every stored record.
    fn list_ids(&self) -> impl Future<Output = StoreResult<Vec<String>>> + Send;

    fn find(&self, id: &str) -> impl Future<Output = StoreResult<Option<Entity>>> + Send;
}
