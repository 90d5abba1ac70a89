use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Latency histogram with fixed millisecond buckets.
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<(u64, u64)>,
    sum_ms: u64,
    count: u64,
    max_ms: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: vec![
                (10, 0),
                (100, 0),
                (1_000, 0),
                (5_000, 0),
                (30_000, 0),
                (120_000, 0),
                (u64::MAX, 0),
            ],
            sum_ms: 0,
            count: 0,
            max_ms: 0,
        }
    }

    pub fn observe(&mut self, value: Duration) {
        let value_ms = value.as_millis() as u64;
        self.sum_ms += value_ms;
        self.count += 1;
        self.max_ms = self.max_ms.max(value_ms);

        for (threshold, count) in &mut self.buckets {
            if value_ms <= *threshold {
                *count += 1;
                break;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum_ms / self.count
        }
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for one ingestion run.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub snapshots_fetched: Counter,
    pub fetch_failures: Counter,
    pub rows_parsed: Counter,
    pub rows_skipped: Counter,
    pub cells_written: Counter,
    pub chunks_flushed: Counter,
    pub fetch_latency: Mutex<Histogram>,
    pub flush_latency: Mutex<Histogram>,
}

pub type SharedMetrics = Arc<PipelineMetrics>;

impl PipelineMetrics {
    pub fn shared() -> SharedMetrics {
        Arc::new(Self::default())
    }

    pub fn log_summary(&self) {
        let fetch = self.fetch_latency.lock().clone();
        let flush = self.flush_latency.lock().clone();
        tracing::info!(
            snapshots_fetched = self.snapshots_fetched.get(),
            fetch_failures = self.fetch_failures.get(),
            rows_parsed = self.rows_parsed.get(),
            rows_skipped = self.rows_skipped.get(),
            cells_written = self.cells_written.get(),
            chunks_flushed = self.chunks_flushed.get(),
            fetch_mean_ms = fetch.mean_ms(),
            flush_mean_ms = flush.mean_ms(),
            flush_max_ms = flush.max_ms(),
            "ingestion metrics"
        );
    }
}
