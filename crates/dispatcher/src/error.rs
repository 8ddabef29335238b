//! Dispatcher error types
//!
//! Sink failures are delivery outcomes, not errors. Everything here stops a
//! run.

use contracts::SinkKind;
use thiserror::Error;

/// Dispatcher-specific errors
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// Sink creation error
    #[error("failed to create sink '{name}': {message}")]
    SinkCreation { name: String, message: String },

    /// A sink worker went away while the coordinator still needed it
    #[error("sink '{sink}' is no longer accepting deliveries")]
    SinkClosed { sink: SinkKind },

    /// No sink is enabled, nothing to fan out to
    #[error("no sinks configured")]
    NoSinks,

    /// A worker task panicked or was cancelled unexpectedly
    #[error("worker task failed: {0}")]
    Worker(String),

    /// Ledger, checkpoint or dead-letter storage failure (from contract)
    #[error("storage error: {0}")]
    Contract(#[from] contracts::ContractError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatcherError {
    /// Create a sink creation error
    pub fn sink_creation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkCreation {
            name: name.into(),
            message: message.into(),
        }
    }
}
