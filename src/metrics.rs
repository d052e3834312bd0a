use std::ops::AddAssign;

/// Added / updated / deleted counters for one generation or reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl Metrics {
    pub const fn zero() -> Self {
        Self {
            added: 0,
            updated: 0,
            deleted: 0,
        }
    }

    pub const fn added() -> Self {
        Self {
            added: 1,
            ..Self::zero()
        }
    }

    pub const fn updated() -> Self {
        Self {
            updated: 1,
            ..Self::zero()
        }
    }

    pub const fn deleted() -> Self {
        Self {
            deleted: 1,
            ..Self::zero()
        }
    }

    /// Element-wise sum into `self`.
    pub fn merge(&mut self, other: Metrics) -> &mut Self {
        self.added += other.added;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self
    }
}

impl AddAssign for Metrics {
    fn add_assign(&mut self, rhs: Self) {
        self.merge(rhs);
    }
}

/// `count` as a percentage of `total`; zero when `total` is zero.
pub fn percent_of(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}
