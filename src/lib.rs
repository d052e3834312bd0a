//! Synthetic product catalog deltas and batched reconciliation.
//!
//! - Generation: build a catalog of N products, insert it into a store and
//!   write a delta file of simulated add/update/delete/unchanged events.
//! - Reconciliation: stream a delta file and converge a store onto it with
//!   bounded bulk upserts and deletes, one bulk write in flight at a time.
//!
//! Data shape:
//! - Delta file: `id,label,price,createdAt,updatedAt,deletedAt` header, then
//!   one [`Entity`] per line; an empty `deletedAt` means the item is live.
//! - Stores implement [`CatalogStore`] (in-memory or SQLite).
#![cfg_attr(docsrs, feature(doc_cfg))]
//
pub mod entity;
mod generate;
mod io;
mod memory;
pub mod metrics;
mod reconcile;
pub mod simulate;
pub mod store;

pub use crate::entity::{Entity, Price, RecordError, Timestamp};
pub use crate::generate::{generate_dataset, generate_to_path, GenerateConfig, GenerationReport};
pub use crate::io::{build_delta_reader, reader_from_path, Compression, DeltaMeta, DeltaWriter};
pub use crate::memory::{MemoryReport, MemoryTracker, DEFAULT_SAMPLE_INTERVAL};
pub use crate::metrics::Metrics;
pub use crate::reconcile::{
    reconcile, reconcile_path, DeletePolicy, ReconcileConfig, ReconcileReport, DEFAULT_BATCH_SIZE,
};
pub use crate::simulate::{EventSimulator, EventThresholds, Outcome};
pub use crate::store::{CatalogStore, MemoryStore, SqliteStore, StoreError};

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Error type returned by this crate when not using `anyhow`.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("Missing required header: {0}")]
    MissingHeader(String),
    #[error("malformed record at line {line}: {source}")]
    MalformedRecord {
        line: u64,
        #[source]
        source: RecordError,
    },
    #[error("failed to read delta stream: {0}")]
    StreamRead(#[from] csv_async::Error),
    #[error("store write failed: {0}")]
    StoreWrite(#[from] StoreError),
    #[error("flush stage stopped before the delta stream was consumed")]
    PipelineClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Installs the global `tracing` subscriber used by the binaries.
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
