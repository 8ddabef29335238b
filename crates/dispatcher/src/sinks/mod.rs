//! Sink implementations
//!
//! Contains CacheSink (with its AggregationStore), WarehouseSink and
//! ExternalSink, plus the destination traits the first two write through.

use std::time::Duration;

use contracts::{ContractError, DeliveryOutcome};

mod aggregation;
mod cache;
mod external;
mod warehouse;

pub use self::aggregation::{engagement_score, event_weight, AggregationStore, ContentStats};
pub use self::cache::{
    content_meta_key, event_key, event_projection, recent_events, recent_events_key, CacheSink,
    MemoryKeyValueStore, RecentEvent,
};
pub use self::external::{classify_status, ExternalMetadata, ExternalPayload, ExternalSink};
pub use self::warehouse::{
    JsonlWarehouseTable, MemoryWarehouseTable, WarehouseRow, WarehouseSink,
};

/// Key-value destination with upsert-by-key and optional expiry
#[trait_variant::make(KeyValueStore: Send)]
pub trait LocalKeyValueStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), ContractError>;

    async fn get(&self, key: &str) -> Result<Option<String>, ContractError>;

    /// Prepend `value` to the list at `key` unless it is already present,
    /// keep the newest `limit` items and reset the expiry. Returns whether
    /// the list changed.
    async fn push_capped(
        &self,
        key: &str,
        value: String,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<bool, ContractError>;

    /// Up to `count` items of the list at `key`, newest first
    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, ContractError>;
}

/// Analytical table with insert-or-ignore by event id
#[trait_variant::make(WarehouseTable: Send)]
pub trait LocalWarehouseTable {
    /// Insert rows whose event id is not present yet. Returns how many were
    /// new.
    async fn insert_or_ignore(&self, rows: Vec<WarehouseRow>) -> Result<usize, ContractError>;
}

/// Map a destination error onto the failure taxonomy
pub(crate) fn outcome_from_error(error: &ContractError) -> DeliveryOutcome {
    match error {
        ContractError::SinkWrite { message, .. } => DeliveryOutcome::permanent(message.clone()),
        other => DeliveryOutcome::transient(other.to_string()),
    }
}
