//! Checkpoint - durable progress marker per namespace

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SourceOffset;

/// Namespace used by the live tail
pub const LIVE_NAMESPACE: &str = "live";

/// Namespace for a backfill over `[start, end)`.
pub fn backfill_namespace(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!("backfill:{}:{}", start.to_rfc3339(), end.to_rfc3339())
}

/// Highest offset at or below which every observed event is terminal at every sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub namespace: String,
    /// `None` until the first event completes
    pub offset: Option<SourceOffset>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(namespace: impl Into<String>, offset: Option<SourceOffset>) -> Self {
        Self {
            namespace: namespace.into(),
            offset,
            updated_at: Utc::now(),
        }
    }

    /// First offset a resumed run should read.
    pub fn resume_offset(&self) -> SourceOffset {
        self.offset.map_or(0, |offset| offset + 1)
    }
}
