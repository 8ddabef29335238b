//! Source metrics and data-quality inspection

use std::sync::atomic::{AtomicU64, Ordering};

use contracts::SourceRecord;
use tracing::warn;

/// Counters shared by a source and whoever reports on it
#[derive(Debug, Default)]
pub struct SourceMetrics {
    /// Records handed to the dispatcher
    pub records_read: AtomicU64,

    /// Records skipped because they fall outside a historical range
    pub records_filtered: AtomicU64,

    /// Data-quality warnings (forwarded anyway)
    pub quality_warnings: AtomicU64,
}

impl SourceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, count: usize) {
        self.records_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_filtered(&self, count: usize) {
        self.records_filtered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SourceMetricsSnapshot {
        SourceMetricsSnapshot {
            records_read: self.records_read.load(Ordering::Relaxed),
            records_filtered: self.records_filtered.load(Ordering::Relaxed),
            quality_warnings: self.quality_warnings.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMetricsSnapshot {
    pub records_read: u64,
    pub records_filtered: u64,
    pub quality_warnings: u64,
}

/// Flag data-quality problems on a record without rejecting it.
pub fn inspect_record(record: &SourceRecord, metrics: &SourceMetrics) {
    if record.event.missing_duration() {
        metrics.quality_warnings.fetch_add(1, Ordering::Relaxed);
        observability::record_data_quality_warning("missing_duration");
        warn!(
            event_id = record.event.id,
            offset = record.offset,
            event_type = %record.event.event_type,
            "Event has no duration_ms; engagement fields will be null"
        );
    }
}
