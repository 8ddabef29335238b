//! Durable pipeline state: ledger, dead letters and checkpoints under one
//! state directory

use std::fs;
use std::sync::Arc;

use contracts::{ContractError, StateConfig};
use tracing::{info, instrument};

use crate::checkpoint::CheckpointStore;
use crate::dead_letter::DeadLetterStore;
use crate::ledger::{DeliveryLedger, LedgerOptions};

#[derive(Debug, Clone)]
pub struct PipelineState {
    pub ledger: Arc<DeliveryLedger>,
    pub dead_letters: Arc<DeadLetterStore>,
    pub checkpoints: Arc<CheckpointStore>,
}

impl PipelineState {
    /// Open every store under `config.dir`, creating it if needed.
    /// Unreadable stores fail with `Corruption`.
    #[instrument(name = "pipeline_state_open", skip(config), fields(dir = %config.dir.display()))]
    pub fn open(config: &StateConfig) -> Result<Self, ContractError> {
        fs::create_dir_all(&config.dir).map_err(|e| {
            ContractError::storage("state", format!("{}: {e}", config.dir.display()))
        })?;

        let state = Self {
            ledger: Arc::new(DeliveryLedger::open(&config.dir, LedgerOptions::from(config))?),
            dead_letters: Arc::new(DeadLetterStore::open(&config.dir, config.fsync)?),
            checkpoints: Arc::new(CheckpointStore::open(&config.dir, config.fsync)?),
        };
        info!(
            ledger_records = state.ledger.len(),
            dead_letters = state.dead_letters.len(),
            "Pipeline state opened"
        );
        Ok(state)
    }

    pub fn in_memory() -> Self {
        Self {
            ledger: Arc::new(DeliveryLedger::in_memory()),
            dead_letters: Arc::new(DeadLetterStore::in_memory()),
            checkpoints: Arc::new(CheckpointStore::in_memory()),
        }
    }
}
