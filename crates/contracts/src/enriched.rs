//! EnrichedEvent - raw event joined with a reference snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ContentType, EventId, EventType};

/// Deterministic product of `(RawEvent, Option<ContentMetadata>, processed_at)`.
///
/// Content fields are `None` when the reference data had no entry; that is a
/// data-quality condition, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub id: EventId,
    pub content_id: Uuid,
    pub user_id: Uuid,
    pub event_type: EventType,
    pub event_ts: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub device: Option<String>,
    pub extra: Option<serde_json::Value>,

    pub content_slug: Option<String>,
    pub content_title: Option<String>,
    pub content_type: Option<ContentType>,
    pub content_length_seconds: Option<i64>,

    pub engagement_seconds: Option<f64>,
    pub engagement_pct: Option<f64>,

    pub processed_at: DateTime<Utc>,
}

impl EnrichedEvent {
    /// Stable key destinations use to discard duplicate deliveries.
    pub fn idempotency_key(&self) -> String {
        format!("engagement-{}", self.id)
    }

    pub fn has_metadata(&self) -> bool {
        self.content_type.is_some()
    }
}
