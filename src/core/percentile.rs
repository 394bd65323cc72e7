//! Bounded-memory latency percentile tracking.
//!
//! A [`PercentileTracker`] keeps the most recent `capacity` samples in a ring
//! buffer. Writes are O(1); reads copy the reservoir under the lock and sort
//! the copy outside of it, so a slow reader never stalls writers for longer
//! than a memcpy.

use serde::Serialize;
use std::sync::Mutex;

/// Percentiles reported by [`PercentileTracker::snapshot`].
pub const REPORTED_PERCENTILES: [f64; 4] = [50.0, 90.0, 95.0, 99.0];

#[derive(Debug)]
struct Reservoir {
    samples: Vec<f64>,
    next: usize,
    capacity: usize,
    /// Observations ever recorded, including evicted ones
    total_count: u64,
    total_sum: f64,
}

impl Reservoir {
    fn push(&mut self, value: f64) {
        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            self.samples[self.next] = value;
        }
        self.next = (self.next + 1) % self.capacity;
        self.total_count += 1;
        self.total_sum += value;
    }
}

/// Point-in-time view of one tracker.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PercentileSnapshot {
    /// All observations ever recorded
    pub count: u64,
    /// Mean over all observations ever recorded
    pub mean: f64,
    /// Samples currently held in the reservoir
    pub window: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

/// Fixed-capacity reservoir of recent latency samples, in milliseconds.
#[derive(Debug)]
pub struct PercentileTracker {
    reservoir: Mutex<Reservoir>,
}

impl PercentileTracker {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "percentile tracker capacity must be positive");
        Self {
            reservoir: Mutex::new(Reservoir {
                samples: Vec::with_capacity(capacity),
                next: 0,
                capacity,
                total_count: 0,
                total_sum: 0.0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Record one observation. Non-finite values are ignored.
    pub fn record(&self, value_ms: f64) {
        if !value_ms.is_finite() {
            return;
        }
        self.lock().push(value_ms);
    }

    /// Observations ever recorded, including evicted ones.
    pub fn count(&self) -> u64 {
        self.lock().total_count
    }

    /// Nearest-rank percentile over the current reservoir.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let sorted = self.sorted_samples();
        nearest_rank(&sorted, p)
    }

    pub fn snapshot(&self) -> PercentileSnapshot {
        let (mut samples, count, sum) = {
            let reservoir = self.lock();
            (
                reservoir.samples.clone(),
                reservoir.total_count,
                reservoir.total_sum,
            )
        };
        samples.sort_by(f64::total_cmp);

        let [p50, p90, p95, p99] = REPORTED_PERCENTILES.map(|p| nearest_rank(&samples, p));

        PercentileSnapshot {
            count,
            mean: if count > 0 { sum / count as f64 } else { 0.0 },
            window: samples.len(),
            min: samples.first().copied(),
            max: samples.last().copied(),
            p50,
            p90,
            p95,
            p99,
        }
    }

    fn sorted_samples(&self) -> Vec<f64> {
        let mut samples = self.lock().samples.clone();
        samples.sort_by(f64::total_cmp);
        samples
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Reservoir> {
        // A panic while holding the lock cannot leave the ring in a torn state
        self.reservoir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[index])
}
