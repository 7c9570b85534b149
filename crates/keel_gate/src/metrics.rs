//! In-process counters for doc-op dispatch behavior.
//!
//! Lightweight and lock-free so they can be bumped on the dispatch and
//! response paths without touching the op mutex.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters for one doc-op (or a group sharing an instance).
#[derive(Debug, Default)]
pub struct ExecMetrics {
    /// Storage sub-requests handed to the session for apply.
    sub_requests_applied: AtomicU64,
    /// Asynchronous flushes issued.
    flushes_issued: AtomicU64,
    /// Batched flush completions received.
    response_batches: AtomicU64,
    /// Non-empty rows blobs appended to the result cache.
    rows_blobs_cached: AtomicU64,
    /// Writes the session deferred into its statement-local buffer.
    writes_buffered: AtomicU64,
    /// Operations canceled by the statement layer.
    ops_canceled: AtomicU64,
}

impl ExecMetrics {
    pub fn record_sub_requests(&self, count: u64) {
        self.sub_requests_applied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_batch(&self) {
        self.response_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rows_blob(&self) {
        self.rows_blobs_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_buffered(&self) {
        self.writes_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancel(&self) {
        self.ops_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sub_requests_applied: self.sub_requests_applied.load(Ordering::Relaxed),
            flushes_issued: self.flushes_issued.load(Ordering::Relaxed),
            response_batches: self.response_batches.load(Ordering::Relaxed),
            rows_blobs_cached: self.rows_blobs_cached.load(Ordering::Relaxed),
            writes_buffered: self.writes_buffered.load(Ordering::Relaxed),
            ops_canceled: self.ops_canceled.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ExecMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sub_requests_applied: u64,
    pub flushes_issued: u64,
    pub response_batches: u64,
    pub rows_blobs_cached: u64,
    pub writes_buffered: u64,
    pub ops_canceled: u64,
}
