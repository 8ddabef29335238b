//! Bounded historical scan

use std::sync::Arc;

use chrono::{DateTime, Utc};
use contracts::{ContractError, EventLog, EventSource, SourceOffset, SourceRecord};
use tracing::{debug, instrument};

use crate::metrics::{inspect_record, SourceMetrics};

/// Yields records whose `event_ts` falls in `[start, end)`, scanning the log
/// from `from_offset` up to its length at construction time, then ends.
pub struct HistoricalRange<L> {
    log: Arc<L>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    next_offset: SourceOffset,
    end_offset: SourceOffset,
    metrics: Arc<SourceMetrics>,
}

impl<L: EventLog + Sync> HistoricalRange<L> {
    #[instrument(name = "historical_range_open", skip_all, fields(%start, %end, from_offset))]
    pub async fn open(
        log: Arc<L>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        from_offset: SourceOffset,
    ) -> Result<Self, ContractError> {
        if start >= end {
            return Err(ContractError::source(format!(
                "empty backfill range: {start} >= {end}"
            )));
        }
        let end_offset = log.len().await?;
        debug!(from_offset, end_offset, "Historical scan bounds");
        Ok(Self {
            log,
            start,
            end,
            next_offset: from_offset,
            end_offset,
            metrics: Arc::new(SourceMetrics::new()),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<SourceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<SourceMetrics> {
        Arc::clone(&self.metrics)
    }

    fn in_range(&self, record: &SourceRecord) -> bool {
        record.event.event_ts >= self.start && record.event.event_ts < self.end
    }
}

impl<L: EventLog + Sync> EventSource for HistoricalRange<L> {
    fn name(&self) -> &str {
        "historical_range"
    }

    async fn next_batch(&mut self, max: usize) -> Result<Option<Vec<SourceRecord>>, ContractError> {
        while self.next_offset < self.end_offset {
            let want = max.min((self.end_offset - self.next_offset) as usize);
            let records = self.log.read_from(self.next_offset, want).await?;
            let Some(last) = records.last() else {
                break;
            };
            self.next_offset = last.offset + 1;

            let scanned = records.len();
            let selected: Vec<SourceRecord> =
                records.into_iter().filter(|r| self.in_range(r)).collect();
            self.metrics.record_filtered(scanned - selected.len());
            if selected.is_empty() {
                continue;
            }
            for record in &selected {
                inspect_record(record, &self.metrics);
            }
            self.metrics.record_read(selected.len());
            return Ok(Some(selected));
        }
        Ok(None)
    }
}
