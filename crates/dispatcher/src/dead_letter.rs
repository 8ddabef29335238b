//! Dead-letter store - permanently failed deliveries kept for replay

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use contracts::{ContractError, EnrichedEvent, EventId, SinkKind, SinkWriter};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::journal::{read_journal, Journal};

const STORE: &str = "dead_letters";
pub const DEAD_LETTER_FILE: &str = "dead_letters.jsonl";

/// A permanently failed `(event, sink)` delivery with its full payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event_id: EventId,
    pub sink: SinkKind,
    pub last_error: String,
    pub attempts: u32,
    pub payload: EnrichedEvent,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum DeadLetterEntry {
    DeadLetter(DeadLetter),
    Replayed {
        event_id: EventId,
        sink: SinkKind,
        replayed_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct DeadLetterInner {
    letters: BTreeMap<(SinkKind, EventId), DeadLetter>,
    journal: Option<Journal>,
}

#[derive(Debug)]
pub struct DeadLetterStore {
    inner: Mutex<DeadLetterInner>,
}

impl DeadLetterStore {
    /// Open (or create) `<dir>/dead_letters.jsonl`. Replayed tombstones hide
    /// the letters they refer to.
    #[instrument(name = "dead_letters_open", skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, fsync: bool) -> Result<Self, ContractError> {
        let path = dir.as_ref().join(DEAD_LETTER_FILE);
        let entries: Vec<DeadLetterEntry> = read_journal(STORE, &path)?;
        let line_count = entries.len();

        let mut letters = BTreeMap::new();
        for entry in entries {
            match entry {
                DeadLetterEntry::DeadLetter(letter) => {
                    letters.insert((letter.sink, letter.event_id), letter);
                }
                DeadLetterEntry::Replayed { event_id, sink, .. } => {
                    letters.remove(&(sink, event_id));
                }
            }
        }
        info!(pending = letters.len(), "Dead-letter store loaded");

        Ok(Self {
            inner: Mutex::new(DeadLetterInner {
                letters,
                journal: Some(Journal::open(STORE, path, fsync, line_count)?),
            }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(DeadLetterInner {
                letters: BTreeMap::new(),
                journal: None,
            }),
        }
    }

    pub fn append(&self, letter: DeadLetter) -> Result<(), ContractError> {
        let mut inner = self.lock();
        if let Some(journal) = inner.journal.as_mut() {
            journal.append(&DeadLetterEntry::DeadLetter(letter.clone()))?;
        }
        warn!(
            event_id = letter.event_id,
            sink = %letter.sink,
            attempts = letter.attempts,
            error = %letter.last_error,
            "Event dead-lettered"
        );
        inner.letters.insert((letter.sink, letter.event_id), letter);
        Ok(())
    }

    /// Letters not yet replayed, ordered by sink then event id
    pub fn list(&self) -> Vec<DeadLetter> {
        self.lock().letters.values().cloned().collect()
    }

    pub fn list_for_sink(&self, sink: SinkKind) -> Vec<DeadLetter> {
        self.lock()
            .letters
            .range((sink, EventId::MIN)..=(sink, EventId::MAX))
            .map(|(_, letter)| letter.clone())
            .collect()
    }

    pub fn get(&self, event_id: EventId, sink: SinkKind) -> Option<DeadLetter> {
        self.lock().letters.get(&(sink, event_id)).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tombstone a letter. Returns `false` if there was nothing to replay.
    pub fn mark_replayed(&self, event_id: EventId, sink: SinkKind) -> Result<bool, ContractError> {
        let mut inner = self.lock();
        if !inner.letters.contains_key(&(sink, event_id)) {
            return Ok(false);
        }
        if let Some(journal) = inner.journal.as_mut() {
            journal.append(&DeadLetterEntry::Replayed {
                event_id,
                sink,
                replayed_at: Utc::now(),
            })?;
        }
        inner.letters.remove(&(sink, event_id));
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, DeadLetterInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome counts of a replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub sink: Option<SinkKind>,
    pub attempted: usize,
    pub replayed: usize,
    pub failed: usize,
}

/// Push every pending dead letter of `writer`'s sink through it once.
/// Successes are tombstoned; failures stay in the store.
#[instrument(name = "replay_dead_letters", skip_all, fields(sink = %writer.kind()))]
pub async fn replay_dead_letters<W>(
    store: &DeadLetterStore,
    writer: &W,
) -> Result<ReplayReport, ContractError>
where
    W: SinkWriter + Sync,
{
    let sink = writer.kind();
    let mut report = ReplayReport {
        sink: Some(sink),
        ..ReplayReport::default()
    };

    for letter in store.list_for_sink(sink) {
        report.attempted += 1;
        let outcome = writer.deliver(&letter.payload).await;
        if outcome.is_delivered() {
            store.mark_replayed(letter.event_id, sink)?;
            report.replayed += 1;
        } else {
            report.failed += 1;
            warn!(
                event_id = letter.event_id,
                error = outcome.error().unwrap_or_default(),
                "Replay failed, keeping dead letter"
            );
        }
    }
    writer.flush().await?;

    info!(
        attempted = report.attempted,
        replayed = report.replayed,
        failed = report.failed,
        "Dead-letter replay finished"
    );
    Ok(report)
}
