//! Live tail of an event log

use std::sync::Arc;

use contracts::{ContractError, EventLog, EventSource, SourceOffset, SourceRecord};
use tracing::trace;

use crate::metrics::{inspect_record, SourceMetrics};

/// Follows a log forward from a resume offset. Never exhausts; when caught up
/// it waits for the next append. Dropping a pending `next_batch` is safe: the
/// read position only advances once records are returned.
pub struct LiveTail<L> {
    log: Arc<L>,
    next_offset: SourceOffset,
    metrics: Arc<SourceMetrics>,
}

impl<L: EventLog + Sync> LiveTail<L> {
    pub fn new(log: Arc<L>, start_offset: SourceOffset) -> Self {
        Self {
            log,
            next_offset: start_offset,
            metrics: Arc::new(SourceMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SourceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<SourceMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn position(&self) -> SourceOffset {
        self.next_offset
    }
}

impl<L: EventLog + Sync> EventSource for LiveTail<L> {
    fn name(&self) -> &str {
        "live_tail"
    }

    async fn next_batch(&mut self, max: usize) -> Result<Option<Vec<SourceRecord>>, ContractError> {
        loop {
            let len = self.log.len().await?;
            if self.next_offset < len {
                let records = self.log.read_from(self.next_offset, max).await?;
                if let Some(last) = records.last() {
                    self.next_offset = last.offset + 1;
                    for record in &records {
                        inspect_record(record, &self.metrics);
                    }
                    self.metrics.record_read(records.len());
                    trace!(count = records.len(), next = self.next_offset, "Tail batch");
                    return Ok(Some(records));
                }
            }
            self.log.wait_for_append(len).await;
        }
    }
}
