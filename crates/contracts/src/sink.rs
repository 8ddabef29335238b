//! SinkWriter trait - Dispatcher output interface
//!
//! Defines the adapter-specific write step. Retry, circuit breaking and
//! dead-lettering are layered on top by the dispatcher, so a writer only
//! reports what happened on one attempt.

use crate::{ContractError, DeliveryOutcome, EnrichedEvent, SinkKind};

/// Destination writer
///
/// Methods take `&self`: the dispatcher runs several deliveries to the same
/// sink concurrently, bounded by the sink's concurrency budget.
#[trait_variant::make(SinkWriter: Send)]
pub trait LocalSinkWriter {
    /// Which fan-out slot this writer fills
    fn kind(&self) -> SinkKind;

    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Deliver one event.
    ///
    /// Must be idempotent for the same event id and content. Failures are
    /// reported as outcome values, never as `Err`.
    async fn deliver(&self, event: &EnrichedEvent) -> DeliveryOutcome;

    /// Flush buffer (if any)
    async fn flush(&self) -> Result<(), ContractError>;

    /// Close sink
    async fn close(&self) -> Result<(), ContractError>;
}
