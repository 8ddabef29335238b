//! Layered error definitions
//!
//! Categorized by source: config / source / reference / sink / storage

use thiserror::Error;

/// Unified error type
#[derive(Debug, Error)]
pub enum ContractError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Source Errors =====
    /// Event source read error
    #[error("event source error: {message}")]
    Source { message: String },

    /// A log entry could not be decoded into a `RawEvent`
    #[error("event decode error at offset {offset}: {message}")]
    SourceDecode { offset: u64, message: String },

    // ===== Reference Errors =====
    /// Reference-data fetch error
    #[error("reference data error: {message}")]
    Reference { message: String },

    // ===== Sink Errors =====
    /// Sink write error
    #[error("sink '{sink_name}' write error: {message}")]
    SinkWrite { sink_name: String, message: String },

    /// Sink connection error
    #[error("sink '{sink_name}' connection error: {message}")]
    SinkConnection { sink_name: String, message: String },

    // ===== Durable State Errors =====
    /// Ledger / checkpoint / dead-letter store write or read failure
    #[error("storage error in {store}: {message}")]
    Storage { store: String, message: String },

    /// Durable state is unreadable; the process must halt for an operator
    #[error("corrupted {store}: {message}")]
    Corruption { store: String, message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ContractError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create event source error
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    /// Create reference data error
    pub fn reference(message: impl Into<String>) -> Self {
        Self::Reference {
            message: message.into(),
        }
    }

    /// Create sink write error
    pub fn sink_write(sink_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkWrite {
            sink_name: sink_name.into(),
            message: message.into(),
        }
    }

    /// Create storage error
    pub fn storage(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Create corruption error
    pub fn corruption(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corruption {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Errors that must stop the pipeline rather than be retried or skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Corruption { .. } | Self::SourceDecode { .. }
        )
    }
}
