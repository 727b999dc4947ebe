use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
struct InnerMetrics {
    rows_read: AtomicU64,
    rows_written: AtomicU64,
    duplicates_dropped: AtomicU64,
    rows_rejected: AtomicU64,
    slices_ok: AtomicU64,
    slices_failed: AtomicU64,
    splits: AtomicU64,
    partitions_published: AtomicU64,
    sink_retries: AtomicU64,
    heartbeats: AtomicU64,
}

/// Run-scoped counters. Cheap to clone; clones share the same counters.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<InnerMetrics>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub rows_read: u64,
    pub rows_written: u64,
    pub duplicates_dropped: u64,
    pub rows_rejected: u64,
    pub slices_ok: u64,
    pub slices_failed: u64,
    pub splits: u64,
    pub partitions_published: u64,
    pub sink_retries: u64,
    pub heartbeats: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            inner: Arc::new(InnerMetrics::default()),
        }
    }

    pub fn add_rows_read(&self, count: u64) {
        self.inner.rows_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_rows_written(&self, count: u64) {
        self.inner.rows_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_duplicates(&self, count: u64) {
        self.inner
            .duplicates_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_rejected(&self, count: u64) {
        self.inner.rows_rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn slice_ok(&self) {
        self.inner.slices_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slice_failed(&self) {
        self.inner.slices_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_splits(&self, count: u64) {
        self.inner.splits.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_partitions_published(&self, count: u64) {
        self.inner
            .partitions_published
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_sink_retries(&self, count: u64) {
        self.inner.sink_retries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn heartbeat(&self) {
        self.inner.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            rows_read: load(&self.inner.rows_read),
            rows_written: load(&self.inner.rows_written),
            duplicates_dropped: load(&self.inner.duplicates_dropped),
            rows_rejected: load(&self.inner.rows_rejected),
            slices_ok: load(&self.inner.slices_ok),
            slices_failed: load(&self.inner.slices_failed),
            splits: load(&self.inner.splits),
            partitions_published: load(&self.inner.partitions_published),
            sink_retries: load(&self.inner.sink_retries),
            heartbeats: load(&self.inner.heartbeats),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
