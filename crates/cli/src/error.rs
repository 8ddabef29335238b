//! Error types for CLI operations.

use contracts::ContractError;
use dispatcher::DispatcherError;
use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration could not be loaded or failed validation
    #[error("Invalid configuration: {0}")]
    Config(#[source] ContractError),

    /// A setting the command needs is missing from the configuration
    #[error("Missing setting '{field}': {message}")]
    MissingSetting { field: String, message: String },

    /// Event log, reference data or state directory unusable
    #[error("Failed to open {what}: {source}")]
    Open {
        what: &'static str,
        #[source]
        source: ContractError,
    },

    /// The coordinator stopped on a fatal error
    #[error("Pipeline execution failed: {0}")]
    Pipeline(#[from] DispatcherError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    pub fn missing_setting(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MissingSetting {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn open(what: &'static str, source: ContractError) -> Self {
        Self::Open { what, source }
    }
}

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
