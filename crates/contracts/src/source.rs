//! Event source traits - ingestion output interface
//!
//! `EventLog` is the replayable, durable history; `EventSource` is an
//! iterator over it (live tail or bounded historical range) that the
//! dispatcher pulls from.

use crate::{ContractError, RawEvent, SourceOffset, SourceRecord};

/// Ordered, replayable log of raw events.
#[trait_variant::make(EventLog: Send)]
pub trait LocalEventLog {
    /// Append an event, returning its offset
    async fn append(&self, event: RawEvent) -> Result<SourceOffset, ContractError>;

    /// Read up to `max` records starting at `offset` (inclusive)
    async fn read_from(
        &self,
        offset: SourceOffset,
        max: usize,
    ) -> Result<Vec<SourceRecord>, ContractError>;

    /// Number of events in the log (the next offset to be assigned)
    async fn len(&self) -> Result<u64, ContractError>;

    /// Resolve once the log grows beyond `known_len`, or after an
    /// implementation-defined poll interval, whichever comes first.
    async fn wait_for_append(&self, known_len: u64);
}

/// Pull-based iterator the dispatcher consumes.
#[trait_variant::make(EventSource: Send)]
pub trait LocalEventSource {
    /// Source name (used for logging)
    fn name(&self) -> &str;

    /// Next batch of at most `max` records in offset order.
    ///
    /// Returns `Ok(None)` once the source is exhausted. A live tail never
    /// exhausts on its own; it waits for new appends.
    async fn next_batch(&mut self, max: usize) -> Result<Option<Vec<SourceRecord>>, ContractError>;
}
