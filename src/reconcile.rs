//! Delta-file reconciliation.
//!
//! The delta stream is decoded and grouped into bounded batches of keyed
//! writes: a tombstoned row becomes a delete, any other row an upsert. Two
//! stages run concurrently on the calling task:
//!
//! - decode: reads rows in file order and hands full batches to a channel of
//!   depth 1, waiting while the channel is full;
//! - flush: applies batches one at a time, so at most one bulk write is ever
//!   in flight, and accumulates the result counts.
//!
//! The final partial batch is always sent when the stream ends, and the run
//! only returns once the flush stage has drained the channel. A failure in
//! either stage drops the other, so no write starts after an error.

use crate::entity::{Entity, RecordError, FIELD_NAMES};
use crate::io::reader_from_path;
use crate::metrics::Metrics;
use crate::store::{BulkWriteResult, CatalogStore, WriteOp};
use crate::{CatalogError, CatalogResult};
use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// How records that should no longer exist are found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Only tombstoned rows delete.
    #[default]
    Tombstone,
    /// Tombstoned rows delete, and after the stream is applied every stored
    /// id that never appeared in it is deleted too.
    FullScan,
}

impl FromStr for DeletePolicy {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tombstone" => Ok(DeletePolicy::Tombstone),
            "full-scan" => Ok(DeletePolicy::FullScan),
            other => Err(CatalogError::Configuration(format!(
                "unknown delete policy '{other}', expected 'tombstone' or 'full-scan'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Operations per bulk write.
    pub batch_size: usize,
    pub delete_policy: DeletePolicy,
    /// Extra attempts for a failed bulk write. Writes are idempotent by id.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            delete_policy: DeletePolicy::default(),
            max_retries: 0,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Totals of one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Data rows read from the delta stream.
    pub rows_processed: u64,
    /// Bulk writes applied, sweep included.
    pub batches_flushed: u64,
    /// Records removed by the full-scan sweep.
    pub swept: u64,
    pub metrics: Metrics,
}

impl ReconcileReport {
    pub fn log(&self) {
        info!("Processed {} CSV rows.", self.rows_processed);
        info!("Added {} new products.", self.metrics.added);
        info!("Updated {} existing products.", self.metrics.updated);
        info!("Deleted {} products.", self.metrics.deleted);
    }
}

/// Opens the delta file at `path` and reconciles it into `store`.
pub async fn reconcile_path<S: CatalogStore>(
    path: &Path,
    store: &S,
    config: &ReconcileConfig,
) -> CatalogResult<ReconcileReport> {
    let (reader, meta) = reader_from_path(path).await?;
    info!(
        source = %meta.name_hint,
        compression = ?meta.compression,
        store = store.name(),
        batch_size = config.batch_size,
        policy = ?config.delete_policy,
        "reconciling catalog"
    );
    reconcile(reader, store, config).await
}

/// Streams delta rows from `reader` into `store` in batches of `config.batch_size`.
pub async fn reconcile<R, S>(
    reader: R,
    store: &S,
    config: &ReconcileConfig,
) -> CatalogResult<ReconcileReport>
where
    R: AsyncRead + Unpin + Send,
    S: CatalogStore,
{
    if config.batch_size == 0 {
        return Err(CatalogError::Configuration(
            "batch size must be at least 1".into(),
        ));
    }

    let mut rdr = AsyncReaderBuilder::new()
        .has_headers(true)
        // width is checked per row so a bad row reports as a malformed record
        .flexible(true)
        .buffer_capacity(1 << 20) // 1 MiB
        .create_reader(reader);
    let layout = ColumnLayout::from_headers(rdr.headers().await?)?;

    let (tx, rx) = mpsc::channel::<Vec<WriteOp>>(1);
    let (decoded, flushed) = futures::try_join!(
        decode_rows(&mut rdr, &layout, tx, config),
        flush_batches(rx, store, config)
    )?;

    let mut report = ReconcileReport {
        rows_processed: decoded.rows,
        batches_flushed: flushed.batches,
        swept: 0,
        metrics: flushed.metrics,
    };

    if let Some(seen) = decoded.seen_ids {
        let sweep = sweep_absent(store, &seen, config).await?;
        report.batches_flushed += sweep.batches;
        report.swept = sweep.metrics.deleted;
        report.metrics.merge(sweep.metrics);
    }

    Ok(report)
}

/// Positions of the entity fields within the delta header.
struct ColumnLayout {
    indices: Vec<usize>,
    width: usize,
}

impl ColumnLayout {
    fn from_headers(headers: &StringRecord) -> CatalogResult<Self> {
        let indices = FIELD_NAMES
            .iter()
            .map(|name| {
                headers
                    .iter()
                    .position(|h| h == *name)
                    .ok_or_else(|| CatalogError::MissingHeader(name.to_string()))
            })
            .collect::<CatalogResult<Vec<_>>>()?;
        Ok(Self {
            indices,
            width: headers.len(),
        })
    }

    fn entity(&self, record: &StringRecord, line: u64) -> CatalogResult<Entity> {
        if record.len() != self.width {
            return Err(CatalogError::MalformedRecord {
                line,
                source: RecordError::FieldCount {
                    expected: self.width,
                    found: record.len(),
                },
            });
        }
        Entity::from_fields(self.indices.iter().map(|&i| record.get(i).unwrap_or_default()))
            .map_err(|source| CatalogError::MalformedRecord { line, source })
    }
}

struct Decoded {
    rows: u64,
    /// Every id seen in the stream, kept only for the full-scan policy.
    seen_ids: Option<HashSet<String>>,
}

async fn decode_rows<R>(
    rdr: &mut AsyncReader<R>,
    layout: &ColumnLayout,
    tx: mpsc::Sender<Vec<WriteOp>>,
    config: &ReconcileConfig,
) -> CatalogResult<Decoded>
where
    R: AsyncRead + Unpin + Send,
{
    let mut decoded = Decoded {
        rows: 0,
        seen_ids: (config.delete_policy == DeletePolicy::FullScan).then(HashSet::new),
    };
    let mut record = StringRecord::new();
    let capacity = config.batch_size.min(DEFAULT_BATCH_SIZE);
    let mut batch = Vec::with_capacity(capacity);

    while rdr.read_record(&mut record).await? {
        decoded.rows += 1;
        // header is line 1
        let line = record
            .position()
            .map(|p| p.line())
            .unwrap_or(decoded.rows + 1);
        let entity = layout.entity(&record, line)?;

        if let Some(seen) = decoded.seen_ids.as_mut() {
            seen.insert(entity.id.clone());
        }
        batch.push(if entity.is_tombstone() {
            WriteOp::Delete { id: entity.id }
        } else {
            WriteOp::Upsert(entity)
        });

        if batch.len() >= config.batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(capacity));
            tx.send(full)
                .await
                .map_err(|_| CatalogError::PipelineClosed)?;
        }
    }

    if !batch.is_empty() {
        tx.send(batch)
            .await
            .map_err(|_| CatalogError::PipelineClosed)?;
    }
    debug!(rows = decoded.rows, "delta stream consumed");
    Ok(decoded)
}

#[derive(Debug, Default)]
struct Flushed {
    batches: u64,
    metrics: Metrics,
}

async fn flush_batches<S: CatalogStore>(
    mut rx: mpsc::Receiver<Vec<WriteOp>>,
    store: &S,
    config: &ReconcileConfig,
) -> CatalogResult<Flushed> {
    let mut flushed = Flushed::default();
    while let Some(batch) = rx.recv().await {
        let result = write_with_retry(store, &batch, config).await?;
        flushed.batches += 1;
        flushed.metrics.merge(result.metrics());
        debug!(
            batch = flushed.batches,
            ops = batch.len(),
            matched = result.matched,
            modified = result.modified,
            upserted = result.upserted,
            deleted = result.deleted,
            "bulk write applied"
        );
    }
    Ok(flushed)
}

/// Deletes every stored id absent from `seen`, `batch_size` ids per bulk write.
async fn sweep_absent<S: CatalogStore>(
    store: &S,
    seen: &HashSet<String>,
    config: &ReconcileConfig,
) -> CatalogResult<Flushed> {
    let absent: Vec<WriteOp> = store
        .list_ids()
        .await?
        .into_iter()
        .filter(|id| !seen.contains(id))
        .map(|id| WriteOp::Delete { id })
        .collect();
    info!(absent = absent.len(), "sweeping records missing from the delta stream");

    let mut flushed = Flushed::default();
    for chunk in absent.chunks(config.batch_size) {
        let result = write_with_retry(store, chunk, config).await?;
        flushed.batches += 1;
        flushed.metrics.merge(result.metrics());
    }
    Ok(flushed)
}

async fn write_with_retry<S: CatalogStore>(
    store: &S,
    ops: &[WriteOp],
    config: &ReconcileConfig,
) -> CatalogResult<BulkWriteResult> {
    let mut attempt = 0;
    loop {
        match store.bulk_write(ops).await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < config.max_retries => {
                attempt += 1;
                warn!(attempt, error = %e, "bulk write failed, retrying");
                tokio::time::sleep(config.retry_backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
