use catalog_delta::entity::parse_timestamp;
use catalog_delta::store::{BulkWriteResult, StoreResult, WriteOp};
use catalog_delta::{
    reconcile, CatalogError, CatalogStore, DeletePolicy, Entity, MemoryStore, Metrics, Price,
    ReconcileConfig, RecordError, SqliteStore, StoreError,
};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

fn product(id: &str, cents: u64, deleted: bool) -> Entity {
    let created = parse_timestamp("2024-06-01T09:00:00.000Z").unwrap();
    Entity {
        id: id.to_string(),
        label: format!("Product_{id}"),
        price: Price::from_cents(cents),
        created_at: created,
        updated_at: created,
        deleted_at: deleted.then(|| parse_timestamp("2024-06-02T09:00:00.000Z").unwrap()),
    }
}

fn delta_csv(rows: &[Entity]) -> Vec<u8> {
    let mut out = Entity::header_line();
    out.push('\n');
    for row in rows {
        out.push_str(&row.to_csv_line());
        out.push('\n');
    }
    out.into_bytes()
}

fn config(batch_size: usize) -> ReconcileConfig {
    ReconcileConfig {
        batch_size,
        ..Default::default()
    }
}

#[tokio::test]
async fn live_row_upserts_and_tombstone_deletes() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.insert_many(vec![product("2", 500, false)]).await?;

    let csv = delta_csv(&[product("1", 100, false), product("2", 500, true)]);
    let report = reconcile(csv.as_slice(), &store, &ReconcileConfig::default()).await?;

    assert_eq!(report.rows_processed, 2);
    assert_eq!(report.batches_flushed, 1);
    assert_eq!(
        report.metrics,
        Metrics {
            added: 1,
            updated: 0,
            deleted: 1
        }
    );
    assert_eq!(store.list_ids().await?, vec!["1"]);
    Ok(())
}

#[tokio::test]
async fn tombstone_for_unknown_id_leaves_it_absent() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let csv = delta_csv(&[product("x", 1, true)]);
    let report = reconcile(csv.as_slice(), &store, &config(10)).await?;

    assert_eq!(report.metrics.deleted, 0);
    assert!(store.find("x").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn one_row_past_threshold_flushes_full_then_singleton_batch() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let rows: Vec<Entity> = (0..4).map(|i| product(&format!("p{i}"), i, false)).collect();

    let report = reconcile(delta_csv(&rows).as_slice(), &store, &config(3)).await?;

    assert_eq!(report.batches_flushed, 2);
    assert_eq!(store.bulk_writes().await, 2);
    // the trailing partial batch is applied before the run returns
    assert_eq!(store.len().await, 4);
    assert_eq!(report.metrics.added, 4);
    Ok(())
}

#[tokio::test]
async fn rows_exactly_filling_batches_send_no_empty_batch() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let rows: Vec<Entity> = (0..6).map(|i| product(&format!("p{i}"), i, false)).collect();

    let report = reconcile(delta_csv(&rows).as_slice(), &store, &config(3)).await?;

    assert_eq!(report.batches_flushed, 2);
    assert_eq!(store.bulk_writes().await, 2);
    Ok(())
}

#[tokio::test]
async fn header_only_stream_writes_nothing() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let report = reconcile(delta_csv(&[]).as_slice(), &store, &config(3)).await?;

    assert_eq!(report.rows_processed, 0);
    assert_eq!(store.bulk_writes().await, 0);
    Ok(())
}

#[tokio::test]
async fn second_run_on_same_delta_is_a_no_op() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store
        .insert_many(vec![product("a", 1, false), product("b", 2, false)])
        .await?;
    let csv = delta_csv(&[
        product("a", 10, false),
        product("b", 2, true),
        product("c", 3, false),
    ]);

    let first = reconcile(csv.as_slice(), &store, &config(2)).await?;
    let after_first = store.records().await;
    let second = reconcile(csv.as_slice(), &store, &config(2)).await?;

    assert_eq!(
        first.metrics,
        Metrics {
            added: 1,
            updated: 1,
            deleted: 1
        }
    );
    assert_eq!(second.metrics, Metrics::zero());
    assert_eq!(store.records().await, after_first);
    Ok(())
}

#[tokio::test]
async fn full_scan_sweeps_ids_missing_from_stream() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store
        .insert_many(vec![
            product("keep", 1, false),
            product("gone1", 2, false),
            product("gone2", 3, false),
            product("tomb", 4, false),
        ])
        .await?;
    let csv = delta_csv(&[product("keep", 1, false), product("tomb", 4, true)]);

    let cfg = ReconcileConfig {
        batch_size: 1,
        delete_policy: DeletePolicy::FullScan,
        ..Default::default()
    };
    let report = reconcile(csv.as_slice(), &store, &cfg).await?;

    assert_eq!(report.swept, 2);
    assert_eq!(report.metrics.deleted, 3);
    // two stream batches, then one delete per swept id
    assert_eq!(report.batches_flushed, 4);
    assert_eq!(store.list_ids().await?, vec!["keep"]);
    Ok(())
}

#[tokio::test]
async fn malformed_row_aborts_before_later_rows_are_written() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let mut csv = delta_csv(&[product("first", 1, false)]);
    csv.extend_from_slice(b"broken,Product_x,not-a-price,2024-06-01T09:00:00.000Z,2024-06-01T09:00:00.000Z,\n");
    csv.extend_from_slice(product("after", 1, false).to_csv_line().as_bytes());
    csv.push(b'\n');

    let err = reconcile(csv.as_slice(), &store, &config(1))
        .await
        .expect_err("malformed row must fail the run");

    assert!(matches!(err, CatalogError::MalformedRecord { line: 3, .. }), "{err}");
    assert!(store.find("after").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn short_row_reports_field_count() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let mut csv = delta_csv(&[]);
    csv.extend_from_slice(b"id1,Product_1,1.00\n");

    let err = reconcile(csv.as_slice(), &store, &config(10)).await.unwrap_err();
    assert!(matches!(err, CatalogError::MalformedRecord { line: 2, .. }), "{err}");
    assert_eq!(store.bulk_writes().await, 0);
    Ok(())
}

#[tokio::test]
async fn sub_millisecond_timestamp_is_malformed_for_every_store() -> anyhow::Result<()> {
    let mut csv = delta_csv(&[]);
    csv.extend_from_slice(
        b"a1,Product_1,1.00,2024-01-01T00:00:00.123456Z,2024-01-01T00:00:00.123456Z,\n",
    );

    let sqlite = SqliteStore::open_in_memory()?;
    let err = reconcile(csv.as_slice(), &sqlite, &config(10)).await.unwrap_err();
    assert!(
        matches!(
            err,
            CatalogError::MalformedRecord {
                line: 2,
                source: RecordError::InvalidField { field: "createdAt", .. }
            }
        ),
        "{err}"
    );
    assert!(sqlite.list_ids().await?.is_empty());

    let memory = MemoryStore::new();
    let err = reconcile(csv.as_slice(), &memory, &config(10)).await.unwrap_err();
    assert!(matches!(err, CatalogError::MalformedRecord { line: 2, .. }), "{err}");
    assert_eq!(memory.bulk_writes().await, 0);
    Ok(())
}

#[tokio::test]
async fn missing_header_fails_before_any_write() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let csv = b"id,label,price\nx,Product_1,1.00\n";

    let err = reconcile(&csv[..], &store, &config(10)).await.unwrap_err();
    assert!(matches!(err, CatalogError::MissingHeader(ref name) if name == "createdAt"));
    assert_eq!(store.bulk_writes().await, 0);
    Ok(())
}

#[tokio::test]
async fn zero_batch_size_is_rejected() {
    let store = MemoryStore::new();
    let err = reconcile(delta_csv(&[]).as_slice(), &store, &config(0))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Configuration(_)));
}

/// Serves `data`, then fails every later read.
struct FailingReader {
    data: io::Cursor<Vec<u8>>,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.data.position() < self.data.get_ref().len() as u64 {
            Pin::new(&mut self.data).poll_read(cx, buf)
        } else {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "device went away")))
        }
    }
}

#[tokio::test]
async fn stream_failure_surfaces_and_skips_pending_batch() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let reader = FailingReader {
        data: io::Cursor::new(delta_csv(&[product("a", 1, false), product("b", 2, false)])),
    };

    let err = reconcile(reader, &store, &config(10)).await.unwrap_err();

    assert!(matches!(err, CatalogError::StreamRead(_)), "{err}");
    assert!(store.is_empty().await);
    assert_eq!(store.bulk_writes().await, 0);
    Ok(())
}

/// Fails the first `failures` bulk writes, then delegates.
#[derive(Clone)]
struct FlakyStore {
    inner: MemoryStore,
    failures: Arc<AtomicU32>,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: Arc::new(AtomicU32::new(failures)),
        }
    }
}

impl CatalogStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn reset(&self) -> StoreResult<()> {
        self.inner.reset().await
    }

    async fn insert_many(&self, entities: Vec<Entity>) -> StoreResult<u64> {
        self.inner.insert_many(entities).await
    }

    async fn bulk_write(&self, ops: &[WriteOp]) -> StoreResult<BulkWriteResult> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Corrupt {
                id: ops.first().map(|op| op.id().to_string()).unwrap_or_default(),
                reason: "injected failure".into(),
            });
        }
        self.inner.bulk_write(ops).await
    }

    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        self.inner.list_ids().await
    }

    async fn find(&self, id: &str) -> StoreResult<Option<Entity>> {
        self.inner.find(id).await
    }
}

#[tokio::test]
async fn failed_bulk_write_is_retried_when_allowed() -> anyhow::Result<()> {
    let store = FlakyStore::new(2);
    let cfg = ReconcileConfig {
        batch_size: 10,
        max_retries: 2,
        retry_backoff: Duration::from_millis(1),
        ..Default::default()
    };

    let report = reconcile(delta_csv(&[product("a", 1, false)]).as_slice(), &store, &cfg).await?;

    assert_eq!(report.metrics.added, 1);
    assert_eq!(store.inner.len().await, 1);
    Ok(())
}

#[tokio::test]
async fn failed_bulk_write_without_retries_is_fatal() {
    let store = FlakyStore::new(1);
    let err = reconcile(delta_csv(&[product("a", 1, false)]).as_slice(), &store, &config(10))
        .await
        .unwrap_err();

    assert!(matches!(err, CatalogError::StoreWrite(_)), "{err}");
    assert!(store.inner.is_empty().await);
}

/// Slow bulk writes that record how many run at once.
struct InFlightStore {
    inner: MemoryStore,
    in_flight: AtomicU32,
    peak: AtomicU32,
}

impl CatalogStore for InFlightStore {
    fn name(&self) -> &'static str {
        "in-flight"
    }

    async fn reset(&self) -> StoreResult<()> {
        self.inner.reset().await
    }

    async fn insert_many(&self, entities: Vec<Entity>) -> StoreResult<u64> {
        self.inner.insert_many(entities).await
    }

    async fn bulk_write(&self, ops: &[WriteOp]) -> StoreResult<BulkWriteResult> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = self.inner.bulk_write(ops).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        self.inner.list_ids().await
    }

    async fn find(&self, id: &str) -> StoreResult<Option<Entity>> {
        self.inner.find(id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bulk_writes_run_one_at_a_time_and_settle_before_return() -> anyhow::Result<()> {
    let store = InFlightStore {
        inner: MemoryStore::new(),
        in_flight: AtomicU32::new(0),
        peak: AtomicU32::new(0),
    };
    let rows: Vec<Entity> = (0..11).map(|i| product(&format!("p{i}"), i, false)).collect();

    let report = reconcile(delta_csv(&rows).as_slice(), &store, &config(2)).await?;

    assert_eq!(report.batches_flushed, 6);
    assert_eq!(store.peak.load(Ordering::SeqCst), 1);
    assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(store.inner.bulk_writes().await, 6);
    assert_eq!(store.inner.len().await, 11);
    assert_eq!(report.metrics.added, 11);
    Ok(())
}
