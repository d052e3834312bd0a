use crate::entity::{self, Entity, Timestamp};
use crate::io::DeltaWriter;
use crate::metrics::{percent_of, Metrics};
use crate::simulate::{EventSimulator, EventThresholds};
use crate::store::CatalogStore;
use crate::CatalogResult;
use chrono::TimeDelta;
use rand::Rng;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct GenerateConfig {
    /// Number of base products to create.
    pub catalog_size: u64,
    pub thresholds: EventThresholds,
}

/// Totals of one generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationReport {
    pub catalog_size: u64,
    /// Base products inserted into the store.
    pub inserted: u64,
    /// Data lines written to the delta file.
    pub delta_rows: u64,
    pub metrics: Metrics,
}

impl GenerationReport {
    pub fn updated_percent(&self) -> f64 {
        percent_of(self.metrics.updated, self.catalog_size)
    }

    pub fn deleted_percent(&self) -> f64 {
        percent_of(self.metrics.deleted, self.catalog_size)
    }

    pub fn log(&self) {
        info!("{} products inserted in store.", self.inserted);
        info!("{} products to be added.", self.metrics.added);
        info!(
            "{} products to be updated {:.2}%.",
            self.metrics.updated,
            self.updated_percent()
        );
        info!(
            "{} products to be deleted {:.2}%.",
            self.metrics.deleted,
            self.deleted_percent()
        );
    }
}

/// Builds `config.catalog_size` base products, writes one simulated delta
/// line per product, then bulk-inserts the base products into `store`.
///
/// The header is written here; the caller owns `writer` and must
/// [`finish`](DeltaWriter::finish) it.
pub async fn generate_dataset<S, R>(
    store: &S,
    writer: &mut DeltaWriter,
    config: &GenerateConfig,
    rng: &mut R,
) -> CatalogResult<GenerationReport>
where
    S: CatalogStore,
    R: Rng + ?Sized,
{
    let catalog_size = config.catalog_size;
    let simulator = EventSimulator::new(config.thresholds, catalog_size);
    let created_at = entity::now();
    let progress_step = (catalog_size / 10).max(1);

    writer.write_header().await?;

    let mut metrics = Metrics::zero();
    let mut products = Vec::with_capacity(usize::try_from(catalog_size).unwrap_or_default());
    for i in 0..catalog_size {
        let product = Entity::new(i, created_at, rng);
        let delta = simulator.simulate(&product, i, event_instant(created_at), rng);
        writer.write_entity(&delta).await?;
        metrics.merge(classify(&product, &delta));
        products.push(product);

        if i % progress_step == 0 {
            debug!("Processing {}%...", i * 100 / catalog_size);
        }
    }

    let inserted = if products.is_empty() {
        0
    } else {
        store.insert_many(products).await?
    };

    Ok(GenerationReport {
        catalog_size,
        inserted,
        delta_rows: writer.rows(),
        metrics,
    })
}

/// Resets `store`, generates into a fresh delta file at `path` and closes it.
pub async fn generate_to_path<S, R>(
    store: &S,
    path: &Path,
    config: &GenerateConfig,
    rng: &mut R,
) -> CatalogResult<GenerationReport>
where
    S: CatalogStore,
    R: Rng + ?Sized,
{
    // Re-runs start from an empty catalog.
    store.reset().await?;

    let mut writer = DeltaWriter::create(path).await?;
    info!(
        store = store.name(),
        output = %path.display(),
        compression = ?writer.meta().compression,
        size = config.catalog_size,
        "generating dataset"
    );
    let report = generate_dataset(store, &mut writer, config, rng).await?;
    writer.finish().await?;
    Ok(report)
}

/// Events land strictly after the shared creation instant so updates stay
/// distinguishable from untouched products at millisecond precision.
fn event_instant(created_at: Timestamp) -> Timestamp {
    entity::now().max(created_at + TimeDelta::milliseconds(1))
}

/// Which event a delta line represents relative to its base product.
fn classify(base: &Entity, delta: &Entity) -> Metrics {
    if delta.is_tombstone() {
        Metrics::deleted()
    } else if delta.id != base.id {
        Metrics::added()
    } else if delta.updated_at != base.updated_at {
        Metrics::updated()
    } else {
        Metrics::zero()
    }
}
