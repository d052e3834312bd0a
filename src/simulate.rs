//! Random product-lifecycle events used to build a delta file.
//!
//! Each sample is drawn uniformly from `[0, 100)` and falls into exactly one
//! of four contiguous ranges, in order: delete, update, add, unchanged. Only
//! the first three widths are configurable; the unchanged width is whatever
//! remains, so the ranges always cover `[0, 100)` with no gap or overlap.

use crate::entity::{label_for, Entity, Price, Timestamp};
use crate::{CatalogError, CatalogResult};
use rand::Rng;
use std::ops::Range;

/// Width of the sampled interval.
pub const SAMPLE_SPACE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Delete,
    Update,
    Add,
    Unchanged,
}

/// Percentage widths of the delete, update and add ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventThresholds {
    delete: u8,
    update: u8,
    add: u8,
}

impl Default for EventThresholds {
    fn default() -> Self {
        Self {
            delete: 10,
            update: 10,
            add: 20,
        }
    }
}

impl EventThresholds {
    pub fn new(delete: u8, update: u8, add: u8) -> CatalogResult<Self> {
        let total = u16::from(delete) + u16::from(update) + u16::from(add);
        if total > 100 {
            return Err(CatalogError::Configuration(format!(
                "event percentages sum to {total}, must not exceed 100"
            )));
        }
        Ok(Self { delete, update, add })
    }

    pub fn unchanged(&self) -> u8 {
        100 - self.delete - self.update - self.add
    }

    /// Widths in range order: delete, update, add, unchanged.
    pub fn widths(&self) -> [(Outcome, u8); 4] {
        [
            (Outcome::Delete, self.delete),
            (Outcome::Update, self.update),
            (Outcome::Add, self.add),
            (Outcome::Unchanged, self.unchanged()),
        ]
    }

    /// Half-open ranges derived from the widths, covering `[0, 100)`.
    pub fn ranges(&self) -> [(Outcome, Range<f64>); 4] {
        let mut start = 0.0;
        self.widths().map(|(outcome, width)| {
            let end = start + f64::from(width);
            let range = start..end;
            start = end;
            (outcome, range)
        })
    }

    /// Outcome whose range contains `sample`. Samples outside `[0, 100)` are clamped.
    pub fn outcome_for(&self, sample: f64) -> Outcome {
        let sample = sample.clamp(0.0, SAMPLE_SPACE);
        self.ranges()
            .into_iter()
            .find(|(_, range)| range.contains(&sample))
            .map(|(outcome, _)| outcome)
            .unwrap_or(Outcome::Unchanged)
    }
}

/// Derives a delta entity from a base catalog entity.
#[derive(Debug, Clone)]
pub struct EventSimulator {
    thresholds: EventThresholds,
    catalog_size: u64,
}

impl EventSimulator {
    pub fn new(thresholds: EventThresholds, catalog_size: u64) -> Self {
        Self {
            thresholds,
            catalog_size,
        }
    }

    /// Draws an outcome and applies it to `base`.
    pub fn simulate<R: Rng + ?Sized>(
        &self,
        base: &Entity,
        index: u64,
        now: Timestamp,
        rng: &mut R,
    ) -> Entity {
        let outcome = self.thresholds.outcome_for(rng.gen_range(0.0..SAMPLE_SPACE));
        self.apply(outcome, base, index, now, rng)
    }

    pub fn apply<R: Rng + ?Sized>(
        &self,
        outcome: Outcome,
        base: &Entity,
        index: u64,
        now: Timestamp,
        rng: &mut R,
    ) -> Entity {
        let shifted = index + self.catalog_size;
        match outcome {
            // updated_at stays at created_at on a tombstone, not `now`.
            Outcome::Delete => Entity {
                id: base.id.clone(),
                label: label_for(shifted),
                price: Price::random(rng),
                created_at: base.created_at,
                updated_at: base.created_at,
                deleted_at: Some(now),
            },
            Outcome::Update => Entity {
                id: base.id.clone(),
                label: label_for(shifted),
                price: Price::random(rng),
                created_at: base.created_at,
                updated_at: now,
                deleted_at: None,
            },
            Outcome::Add => Entity::new(shifted, now, rng),
            Outcome::Unchanged => base.clone(),
        }
    }
}
