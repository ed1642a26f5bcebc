//! Performance Registry: per-backend latency tracking.
//!
//! One [`PerfRecord`] per backend, indexed by its declaration position so
//! that probing and tie-breaking can stay deterministic. Each record is
//! behind its own mutex so contention on one backend never blocks another.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Smoothing factor for the exponentially-weighted moving average.
pub const EWMA_ALPHA: f64 = 0.2;

/// Capacity of the raw latency window used by the SMA policy.
pub const LATENCY_WINDOW_SIZE: usize = 3;

/// Raw window + EWMA for a single backend.
#[derive(Debug, Default)]
struct PerfRecord {
    raw: VecDeque<i64>,
    ewma: Option<f64>,
}

impl PerfRecord {
    fn record(&mut self, latency_ms: i64) {
        if latency_ms <= 0 {
            return;
        }
        if self.raw.len() == LATENCY_WINDOW_SIZE {
            self.raw.pop_front();
        }
        self.raw.push_back(latency_ms);

        self.ewma = Some(match self.ewma {
            None => latency_ms as f64,
            Some(prev) => EWMA_ALPHA * latency_ms as f64 + (1.0 - EWMA_ALPHA) * prev,
        });
    }

    fn sma(&self) -> f64 {
        let valid: Vec<i64> = self.raw.iter().copied().filter(|&x| x > 0).collect();
        if valid.is_empty() {
            f64::INFINITY
        } else {
            valid.iter().sum::<i64>() as f64 / valid.len() as f64
        }
    }

    fn ewma(&self) -> f64 {
        self.ewma.unwrap_or(f64::INFINITY)
    }

    fn has_samples(&self) -> bool {
        !self.raw.is_empty()
    }
}

/// Latency tracking state for the whole backend set, one [`PerfRecord`] per
/// backend, indexed the same way as the backend list itself.
pub struct PerformanceRegistry {
    records: Vec<Mutex<PerfRecord>>,
}

impl PerformanceRegistry {
    pub fn new(backend_count: usize) -> Self {
        Self {
            records: (0..backend_count).map(|_| Mutex::new(PerfRecord::default())).collect(),
        }
    }

    /// Feed a latency measurement for `backend`. A no-op for non-positive
    /// values (timeouts/errors that never started timing use the `-1`
    /// sentinel; those are filtered here too, defensively).
    pub fn record(&self, backend: usize, latency_ms: i64) {
        let mut rec = self.records[backend].lock().expect("perf record lock poisoned");
        rec.record(latency_ms);
    }

    /// Arithmetic mean of the positive entries in the raw window, or `+inf`
    /// if there are none.
    pub fn sma(&self, backend: usize) -> f64 {
        self.records[backend].lock().expect("perf record lock poisoned").sma()
    }

    /// The stored EWMA, or `+inf` if no sample has landed yet.
    pub fn ewma(&self, backend: usize) -> f64 {
        self.records[backend].lock().expect("perf record lock poisoned").ewma()
    }

    /// True iff at least one sample has been recorded for this backend.
    pub fn has_samples(&self, backend: usize) -> bool {
        self.records[backend].lock().expect("perf record lock poisoned").has_samples()
    }
}
