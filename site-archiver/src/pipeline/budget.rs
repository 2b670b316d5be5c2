//! Wall-clock budget of one slice.

use std::cell::Cell;
use std::time::{Duration, Instant};

/// Elapsed time is measured from slice start and checked only at yield
/// points: before each table, row batch, manifest line and container entry.
///
/// A slice always performs at least one unit of work before it yields, so a
/// budget smaller than a single unit still makes progress.
#[derive(Debug)]
pub struct SliceBudget {
    started: Instant,
    limit: Duration,
    units: Cell<u64>,
}

impl SliceBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
            units: Cell::new(0),
        }
    }

    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self::new(Duration::MAX)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_exceeded(&self) -> bool {
        self.elapsed() >= self.limit
    }

    /// True when the caller must stop before starting the next unit.
    pub fn should_yield(&self) -> bool {
        self.units.get() > 0 && self.is_exceeded()
    }

    pub fn record_unit(&self) {
        self.units.set(self.units.get() + 1);
    }

    pub fn units(&self) -> u64 {
        self.units.get()
    }
}
