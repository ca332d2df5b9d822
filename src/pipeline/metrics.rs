use crate::storage::BatchStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters for one stream, shared between its loop and the status API
#[derive(Debug, Default)]
pub struct StreamMetrics {
    batches_committed: AtomicU64,
    batches_aborted: AtomicU64,
    last_batch_id: AtomicU64,
    events_read: AtomicU64,
    events_processed: AtomicU64,
    duplicates: AtomicU64,
    late_dedup: AtomicU64,
    late_window: AtomicU64,
    malformed: AtomicU64,
    windows_finalized: AtomicU64,
    rows_written: AtomicU64,
    data_loss_gaps: AtomicU64,
    watermark: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub batches_committed: u64,
    pub batches_aborted: u64,
    pub last_batch_id: u64,
    pub events_read: u64,
    pub events_processed: u64,
    pub duplicates: u64,
    pub late_dedup: u64,
    pub late_window: u64,
    pub malformed: u64,
    pub windows_finalized: u64,
    pub rows_written: u64,
    pub data_loss_gaps: u64,
    pub watermark: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the stats of a committed batch
    pub fn record_commit(&self, batch_id: u64, stats: &BatchStats, watermark: Option<DateTime<Utc>>) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.last_batch_id.store(batch_id, Ordering::Relaxed);
        self.events_read.fetch_add(stats.events_read, Ordering::Relaxed);
        self.events_processed.fetch_add(stats.events_processed, Ordering::Relaxed);
        self.duplicates.fetch_add(stats.duplicates, Ordering::Relaxed);
        self.late_dedup.fetch_add(stats.late_dedup, Ordering::Relaxed);
        self.late_window.fetch_add(stats.late_window, Ordering::Relaxed);
        self.malformed.fetch_add(stats.malformed, Ordering::Relaxed);
        self.windows_finalized.fetch_add(stats.windows_finalized, Ordering::Relaxed);
        self.rows_written.fetch_add(stats.rows_written, Ordering::Relaxed);
        self.set_watermark(watermark);
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = None;
        }
    }

    pub fn record_abort(&self, error: &str) {
        self.batches_aborted.fetch_add(1, Ordering::Relaxed);
        self.record_error(error);
    }

    pub fn record_error(&self, error: &str) {
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = Some(error.to_string());
        }
    }

    pub fn record_data_loss(&self) {
        self.data_loss_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_watermark(&self, watermark: Option<DateTime<Utc>>) {
        if let Ok(mut current) = self.watermark.lock() {
            if watermark > *current {
                *current = watermark;
            }
        }
    }

    /// Seed the batch id after recovery
    pub fn set_last_batch_id(&self, batch_id: u64) {
        self.last_batch_id.store(batch_id, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            batches_aborted: self.batches_aborted.load(Ordering::Relaxed),
            last_batch_id: self.last_batch_id.load(Ordering::Relaxed),
            events_read: self.events_read.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            late_dedup: self.late_dedup.load(Ordering::Relaxed),
            late_window: self.late_window.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            windows_finalized: self.windows_finalized.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            data_loss_gaps: self.data_loss_gaps.load(Ordering::Relaxed),
            watermark: self.watermark.lock().ok().and_then(|w| *w),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}
