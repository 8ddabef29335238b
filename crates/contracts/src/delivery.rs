//! Delivery bookkeeping - per (event, sink) outcomes and ledger records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ContractError, EventId};

/// The three fan-out destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Cache,
    Warehouse,
    External,
}

impl SinkKind {
    pub const ALL: [SinkKind; 3] = [Self::Cache, Self::Warehouse, Self::External];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Warehouse => "warehouse",
            Self::External => "external",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkKind {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cache" => Ok(Self::Cache),
            "warehouse" => Ok(Self::Warehouse),
            "external" => Ok(Self::External),
            other => Err(ContractError::Other(format!("unknown sink '{other}'"))),
        }
    }
}

/// Failure taxonomy for retryable outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error or timeout
    TransientIo,
    /// Destination overloaded or throttling
    Capacity,
    /// Rejected payload or auth failure; never retried
    Permanent,
}

/// Result of a single delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    RetryableFailure { kind: FailureKind, error: String },
    PermanentFailure { error: String },
}

impl DeliveryOutcome {
    pub fn transient(error: impl Into<String>) -> Self {
        Self::RetryableFailure {
            kind: FailureKind::TransientIo,
            error: error.into(),
        }
    }

    pub fn capacity(error: impl Into<String>) -> Self {
        Self::RetryableFailure {
            kind: FailureKind::Capacity,
            error: error.into(),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self::PermanentFailure {
            error: error.into(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Delivered => None,
            Self::RetryableFailure { kind, .. } => Some(*kind),
            Self::PermanentFailure { .. } => Some(FailureKind::Permanent),
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Delivered => None,
            Self::RetryableFailure { error, .. } | Self::PermanentFailure { error } => Some(error),
        }
    }
}

/// Per (event, sink) state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    DeadLettered,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Ledger entry keyed by `(event_id, sink)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub event_id: EventId,
    pub sink: SinkKind,
    pub state: DeliveryState,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn pending(event_id: EventId, sink: SinkKind) -> Self {
        Self {
            event_id,
            sink,
            state: DeliveryState::Pending,
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
