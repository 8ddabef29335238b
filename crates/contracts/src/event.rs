//! RawEvent - immutable engagement facts produced by the event source

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Source-assigned event identifier (monotonic within a partition key)
pub type EventId = u64;

/// 0-based position of an event in the source log
pub type SourceOffset = u64;

/// Engagement event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Play,
    Pause,
    Finish,
    Click,
}

impl EventType {
    pub const ALL: [EventType; 4] = [Self::Play, Self::Pause, Self::Finish, Self::Click];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Finish => "finish",
            Self::Click => "click",
        }
    }

    /// Whether events of this type are expected to carry `duration_ms`.
    pub fn expects_duration(&self) -> bool {
        !matches!(self, Self::Click)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable engagement fact. Never mutated after the source produces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: EventId,
    pub content_id: Uuid,
    pub user_id: Uuid,
    pub event_type: EventType,
    pub event_ts: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub device: Option<String>,
    /// Opaque payload carried through to every sink
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
}

impl RawEvent {
    pub fn partition_key(&self, by: PartitionBy) -> PartitionKey {
        match by {
            PartitionBy::ContentId => PartitionKey(self.content_id),
            PartitionBy::UserId => PartitionKey(self.user_id),
        }
    }

    /// A play/pause/finish event without a duration. Forwarded, but worth flagging.
    pub fn missing_duration(&self) -> bool {
        self.event_type.expects_duration() && self.duration_ms.is_none()
    }
}

/// Which identity the ordering guarantee is scoped to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBy {
    #[default]
    ContentId,
    UserId,
}

/// Key under which events are delivered in source order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(pub Uuid);

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event together with its position in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub offset: SourceOffset,
    pub event: RawEvent,
}
