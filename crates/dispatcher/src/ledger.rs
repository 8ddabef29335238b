//! Delivery ledger - durable `(event_id, sink) -> state` records
//!
//! In-memory map backed by an append-only JSONL journal. The journal holds
//! full `DeliveryRecord`s; replay keeps the last line per key. Lines are
//! written on terminal transitions and on rescheduled retries, never when a
//! record is merely opened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use contracts::{ContractError, DeliveryRecord, DeliveryState, EventId, SinkKind, StateConfig};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::journal::{read_journal, Journal};

const STORE: &str = "ledger";
pub const LEDGER_FILE: &str = "ledger.jsonl";

#[derive(Debug, Clone, Copy)]
pub struct LedgerOptions {
    pub fsync: bool,
    /// Journal lines that trigger a compaction
    pub compact_threshold: usize,
    /// Terminal records older than this are dropped on compaction
    pub retention: Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            fsync: false,
            compact_threshold: 50_000,
            retention: Duration::from_secs(72 * 3600),
        }
    }
}

impl From<&StateConfig> for LedgerOptions {
    fn from(config: &StateConfig) -> Self {
        Self {
            fsync: config.fsync,
            compact_threshold: config.ledger_compact_threshold.max(1),
            retention: Duration::from_secs(config.retention_hours * 3600),
        }
    }
}

/// Counts by state, for `inspect`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub events: usize,
    pub pending: usize,
    pub delivered: usize,
    pub dead_lettered: usize,
}

#[derive(Debug)]
struct LedgerInner {
    records: HashMap<(EventId, SinkKind), DeliveryRecord>,
    journal: Option<Journal>,
    /// Live records as of the last rewrite (or load)
    compacted_len: usize,
    compactions: u64,
}

#[derive(Debug)]
pub struct DeliveryLedger {
    options: LedgerOptions,
    inner: Mutex<LedgerInner>,
}

impl DeliveryLedger {
    /// Open (or create) `<dir>/ledger.jsonl` and replay it.
    #[instrument(name = "ledger_open", skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, options: LedgerOptions) -> Result<Self, ContractError> {
        let path: PathBuf = dir.as_ref().join(LEDGER_FILE);
        let lines: Vec<DeliveryRecord> = read_journal(STORE, &path)?;
        let line_count = lines.len();

        let mut records = HashMap::with_capacity(line_count);
        for record in lines {
            records.insert((record.event_id, record.sink), record);
        }
        info!(
            records = records.len(),
            journal_lines = line_count,
            "Delivery ledger loaded"
        );

        let journal = Journal::open(STORE, path, options.fsync, line_count)?;
        Ok(Self {
            options,
            inner: Mutex::new(LedgerInner {
                compacted_len: records.len(),
                records,
                journal: Some(journal),
                compactions: 0,
            }),
        })
    }

    /// Ledger without a journal (tests, dry runs)
    pub fn in_memory() -> Self {
        Self {
            options: LedgerOptions::default(),
            inner: Mutex::new(LedgerInner {
                records: HashMap::new(),
                journal: None,
                compacted_len: 0,
                compactions: 0,
            }),
        }
    }

    pub fn get(&self, event_id: EventId, sink: SinkKind) -> Option<DeliveryRecord> {
        self.lock().records.get(&(event_id, sink)).cloned()
    }

    /// Existing record, or a fresh pending one. Opening a record is not
    /// journaled.
    pub fn open_record(&self, event_id: EventId, sink: SinkKind) -> DeliveryRecord {
        self.lock()
            .records
            .entry((event_id, sink))
            .or_insert_with(|| DeliveryRecord::pending(event_id, sink))
            .clone()
    }

    /// Record a retryable failure: still pending, with the attempt count and
    /// the instant the next attempt is due.
    pub fn record_attempt(
        &self,
        event_id: EventId,
        sink: SinkKind,
        attempt_count: u32,
        last_error: Option<String>,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<DeliveryRecord, ContractError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.records.get(&(event_id, sink)) {
            if existing.is_terminal() {
                return Ok(existing.clone());
            }
        }
        let record = DeliveryRecord {
            event_id,
            sink,
            state: DeliveryState::Pending,
            attempt_count,
            last_error,
            next_retry_at,
            updated_at: Utc::now(),
        };
        self.persist(&mut inner, record)
    }

    /// Move a record to `Delivered` or `DeadLettered`. A record that is
    /// already terminal is returned unchanged.
    pub fn mark_terminal(
        &self,
        event_id: EventId,
        sink: SinkKind,
        state: DeliveryState,
        attempt_count: u32,
        last_error: Option<String>,
    ) -> Result<DeliveryRecord, ContractError> {
        if !state.is_terminal() {
            return Err(ContractError::storage(
                STORE,
                format!("refusing to mark event {event_id} at {sink} terminal as {state:?}"),
            ));
        }

        let mut inner = self.lock();
        if let Some(existing) = inner.records.get(&(event_id, sink)) {
            if existing.is_terminal() {
                debug!(event_id, %sink, "Already terminal, keeping existing record");
                return Ok(existing.clone());
            }
        }
        let record = DeliveryRecord {
            event_id,
            sink,
            state,
            attempt_count,
            last_error,
            next_retry_at: None,
            updated_at: Utc::now(),
        };
        let record = self.persist(&mut inner, record)?;
        self.maybe_compact(&mut inner)?;
        Ok(record)
    }

    pub fn is_terminal(&self, event_id: EventId, sink: SinkKind) -> bool {
        self.lock()
            .records
            .get(&(event_id, sink))
            .is_some_and(DeliveryRecord::is_terminal)
    }

    /// True when every sink in `sinks` holds a terminal record for the event.
    pub fn all_terminal(&self, event_id: EventId, sinks: &[SinkKind]) -> bool {
        let inner = self.lock();
        sinks.iter().all(|sink| {
            inner
                .records
                .get(&(event_id, *sink))
                .is_some_and(DeliveryRecord::is_terminal)
        })
    }

    /// Every record still pending, ordered by event id
    pub fn pending(&self) -> Vec<DeliveryRecord> {
        let mut pending: Vec<_> = self
            .lock()
            .records
            .values()
            .filter(|record| !record.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|record| (record.event_id, record.sink));
        pending
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> LedgerSummary {
        let inner = self.lock();
        let mut summary = LedgerSummary::default();
        let mut events = std::collections::HashSet::new();
        for record in inner.records.values() {
            events.insert(record.event_id);
            match record.state {
                DeliveryState::Pending => summary.pending += 1,
                DeliveryState::Delivered => summary.delivered += 1,
                DeliveryState::DeadLettered => summary.dead_lettered += 1,
            }
        }
        summary.events = events.len();
        summary
    }

    /// Rewrite the journal with one line per live record, dropping terminal
    /// records last updated before `now - retention`.
    #[instrument(name = "ledger_compact", skip(self))]
    pub fn compact(&self, now: DateTime<Utc>) -> Result<usize, ContractError> {
        let mut inner = self.lock();
        self.compact_locked(&mut inner, now)
    }

    /// Journal rewrites since the ledger was opened
    pub fn compactions(&self) -> u64 {
        self.lock().compactions
    }

    /// Compact once the journal holds at least twice the lines the last
    /// rewrite left, so a large live set does not rewrite on every append.
    fn maybe_compact(&self, inner: &mut LedgerInner) -> Result<(), ContractError> {
        let trigger = self.options.compact_threshold.max(2 * inner.compacted_len);
        let due = inner
            .journal
            .as_ref()
            .is_some_and(|journal| journal.lines() >= trigger);
        if due {
            self.compact_locked(inner, Utc::now())?;
        }
        Ok(())
    }

    fn compact_locked(
        &self,
        inner: &mut LedgerInner,
        now: DateTime<Utc>,
    ) -> Result<usize, ContractError> {
        let retention = chrono::Duration::from_std(self.options.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let before = inner.records.len();
        inner
            .records
            .retain(|_, record| !record.is_terminal() || record.updated_at >= cutoff);
        let dropped = before - inner.records.len();

        if let Some(journal) = inner.journal.as_mut() {
            let mut live: Vec<&DeliveryRecord> = inner.records.values().collect();
            live.sort_by_key(|record| (record.event_id, record.sink));
            journal.rewrite(live)?;
        }
        inner.compacted_len = inner.records.len();
        inner.compactions += 1;
        info!(
            dropped,
            kept = inner.records.len(),
            compactions = inner.compactions,
            "Ledger compacted"
        );
        Ok(dropped)
    }

    fn persist(
        &self,
        inner: &mut LedgerInner,
        record: DeliveryRecord,
    ) -> Result<DeliveryRecord, ContractError> {
        if let Some(journal) = inner.journal.as_mut() {
            journal.append(&record)?;
        }
        inner
            .records
            .insert((record.event_id, record.sink), record.clone());
        Ok(record)
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn options(compact_threshold: usize) -> LedgerOptions {
        LedgerOptions {
            compact_threshold,
            ..LedgerOptions::default()
        }
    }

    #[test]
    fn terminal_state_is_sticky() {
        let ledger = DeliveryLedger::in_memory();
        ledger
            .mark_terminal(1, SinkKind::Cache, DeliveryState::Delivered, 1, None)
            .unwrap();
        let again = ledger
            .mark_terminal(
                1,
                SinkKind::Cache,
                DeliveryState::DeadLettered,
                4,
                Some("late".into()),
            )
            .unwrap();
        assert_eq!(again.state, DeliveryState::Delivered);
        assert_eq!(again.attempt_count, 1);

        let attempt = ledger
            .record_attempt(1, SinkKind::Cache, 9, Some("x".into()), None)
            .unwrap();
        assert_eq!(attempt.state, DeliveryState::Delivered);
    }

    #[test]
    fn all_terminal_needs_every_sink() {
        let ledger = DeliveryLedger::in_memory();
        let sinks = SinkKind::ALL;
        ledger.open_record(7, SinkKind::External);
        ledger
            .mark_terminal(7, SinkKind::Cache, DeliveryState::Delivered, 1, None)
            .unwrap();
        ledger
            .mark_terminal(7, SinkKind::Warehouse, DeliveryState::Delivered, 1, None)
            .unwrap();
        assert!(!ledger.all_terminal(7, &sinks));
        assert!(ledger.all_terminal(7, &sinks[..2]));

        ledger
            .mark_terminal(
                7,
                SinkKind::External,
                DeliveryState::DeadLettered,
                8,
                Some("503".into()),
            )
            .unwrap();
        assert!(ledger.all_terminal(7, &sinks));
        assert!(ledger.is_terminal(7, SinkKind::External));
    }

    #[test]
    fn mark_terminal_rejects_pending() {
        let ledger = DeliveryLedger::in_memory();
        assert!(ledger
            .mark_terminal(1, SinkKind::Cache, DeliveryState::Pending, 1, None)
            .is_err());
    }

    #[test]
    fn survives_restart_with_attempt_counts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = DeliveryLedger::open(dir.path(), LedgerOptions::default()).unwrap();
            ledger.open_record(1, SinkKind::External);
            ledger
                .record_attempt(1, SinkKind::External, 3, Some("503".into()), Some(Utc::now()))
                .unwrap();
            ledger
                .mark_terminal(1, SinkKind::Cache, DeliveryState::Delivered, 1, None)
                .unwrap();
        }

        let ledger = DeliveryLedger::open(dir.path(), LedgerOptions::default()).unwrap();
        let external = ledger.get(1, SinkKind::External).unwrap();
        assert_eq!(external.state, DeliveryState::Pending);
        assert_eq!(external.attempt_count, 3);
        assert_eq!(external.last_error.as_deref(), Some("503"));
        assert!(ledger.is_terminal(1, SinkKind::Cache));
        assert_eq!(ledger.pending().len(), 1);
    }

    #[test]
    fn happy_path_writes_one_line_per_sink() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DeliveryLedger::open(dir.path(), LedgerOptions::default()).unwrap();
        for sink in SinkKind::ALL {
            ledger.open_record(5, sink);
            ledger
                .mark_terminal(5, sink, DeliveryState::Delivered, 1, None)
                .unwrap();
        }
        let text = fs::read_to_string(dir.path().join(LEDGER_FILE)).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn torn_tail_is_ignored_but_corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = DeliveryLedger::open(dir.path(), LedgerOptions::default()).unwrap();
            ledger
                .mark_terminal(1, SinkKind::Cache, DeliveryState::Delivered, 1, None)
                .unwrap();
        }
        let path = dir.path().join(LEDGER_FILE);
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("{\"event_id\":2,\"sink\":\"ca");
        fs::write(&path, &text).unwrap();

        let ledger = DeliveryLedger::open(dir.path(), LedgerOptions::default()).unwrap();
        assert_eq!(ledger.len(), 1);
        drop(ledger);

        fs::write(&path, "oops\n").unwrap();
        let err = DeliveryLedger::open(dir.path(), LedgerOptions::default()).unwrap_err();
        assert!(matches!(err, ContractError::Corruption { .. }));
    }

    #[test]
    fn compaction_keeps_pending_and_recent_records() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DeliveryLedger::open(dir.path(), options(1_000)).unwrap();
        ledger
            .record_attempt(1, SinkKind::External, 1, Some("503".into()), None)
            .unwrap();
        ledger
            .record_attempt(1, SinkKind::External, 2, Some("503".into()), None)
            .unwrap();
        ledger
            .mark_terminal(2, SinkKind::Cache, DeliveryState::Delivered, 1, None)
            .unwrap();

        // Far future: everything terminal is past retention
        let dropped = ledger.compact(Utc::now() + chrono::Duration::days(30)).unwrap();
        assert_eq!(dropped, 1);

        let text = fs::read_to_string(dir.path().join(LEDGER_FILE)).unwrap();
        assert_eq!(text.lines().count(), 1);

        drop(ledger);
        let reopened = DeliveryLedger::open(dir.path(), options(1_000)).unwrap();
        assert_eq!(reopened.get(1, SinkKind::External).unwrap().attempt_count, 2);
        assert!(reopened.get(2, SinkKind::Cache).is_none());
    }

    #[test]
    fn threshold_triggers_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DeliveryLedger::open(dir.path(), options(4)).unwrap();
        for attempt in 1..=3 {
            ledger
                .record_attempt(1, SinkKind::External, attempt, None, None)
                .unwrap();
        }
        ledger
            .mark_terminal(1, SinkKind::External, DeliveryState::Delivered, 4, None)
            .unwrap();

        let text = fs::read_to_string(dir.path().join(LEDGER_FILE)).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(ledger.is_terminal(1, SinkKind::External));
    }

    #[test]
    fn large_live_set_does_not_compact_on_every_write() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DeliveryLedger::open(dir.path(), options(4)).unwrap();
        for id in 0..20 {
            ledger
                .mark_terminal(id, SinkKind::Cache, DeliveryState::Delivered, 1, None)
                .unwrap();
        }

        // Rewrites at 4, 8 and 16 lines, each doubling the next trigger
        assert_eq!(ledger.compactions(), 3);
        assert_eq!(ledger.len(), 20);
        let text = fs::read_to_string(dir.path().join(LEDGER_FILE)).unwrap();
        assert_eq!(text.lines().count(), 20);

        drop(ledger);
        let reopened = DeliveryLedger::open(dir.path(), options(4)).unwrap();
        assert!((0..20).all(|id| reopened.is_terminal(id, SinkKind::Cache)));
    }

    #[test]
    fn summary_counts_states() {
        let ledger = DeliveryLedger::in_memory();
        ledger.open_record(1, SinkKind::External);
        ledger
            .mark_terminal(1, SinkKind::Cache, DeliveryState::Delivered, 1, None)
            .unwrap();
        ledger
            .mark_terminal(2, SinkKind::Cache, DeliveryState::DeadLettered, 3, None)
            .unwrap();
        assert_eq!(
            ledger.summary(),
            LedgerSummary {
                events: 2,
                pending: 1,
                delivered: 1,
                dead_lettered: 1,
            }
        );
    }
}
