//! Backfill controller - the dispatch coordinator over a historical range
//!
//! Reads `[start, end)` from the durable log with relaxed ordering and the
//! backfill concurrency budget. Progress lives in its own checkpoint
//! namespace, so a rerun of the same range resumes and the live checkpoint
//! is never touched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use contracts::{backfill_namespace, ContractError, EventLog, PipelineBlueprint, ReferenceSource};
use ingestion::HistoricalRange;
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::coordinator::{
    CoordinatorParts, CoordinatorSettings, DispatchCoordinator, DispatchMode, RunReport,
};
use crate::error::DispatcherError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BackfillRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ContractError> {
        if start >= end {
            return Err(ContractError::config_validation(
                "backfill.range",
                format!("start {start} must be before end {end}"),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn namespace(&self) -> String {
        backfill_namespace(self.start, self.end)
    }

    pub fn mode(&self) -> DispatchMode {
        DispatchMode::Backfill {
            start: self.start,
            end: self.end,
        }
    }
}

pub struct BackfillController<L> {
    log: Arc<L>,
    blueprint: PipelineBlueprint,
}

impl<L> BackfillController<L>
where
    L: EventLog + Sync + 'static,
{
    pub fn new(log: Arc<L>, blueprint: PipelineBlueprint) -> Self {
        Self { log, blueprint }
    }

    pub fn settings(&self, range: BackfillRange) -> CoordinatorSettings {
        CoordinatorSettings::new(range.mode(), &self.blueprint)
    }

    #[instrument(
        name = "backfill_run",
        skip(self, parts, shutdown),
        fields(start = %range.start, end = %range.end)
    )]
    pub async fn run<R>(
        &self,
        range: BackfillRange,
        parts: CoordinatorParts<R>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunReport, DispatcherError>
    where
        R: ReferenceSource + Sync + 'static,
    {
        let coordinator = DispatchCoordinator::new(self.settings(range), parts)?;
        let from_offset = coordinator.resume_offset();
        info!(
            namespace = %range.namespace(),
            from_offset,
            concurrency = coordinator.settings().max_in_flight,
            "Backfill starting"
        );

        let source = HistoricalRange::open(Arc::clone(&self.log), range.start, range.end, from_offset).await?;
        coordinator.run(source, shutdown).await
    }
}
