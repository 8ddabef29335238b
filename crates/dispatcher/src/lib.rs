//! # Dispatcher
//!
//! Delivery side of the engagement pipeline.
//!
//! Responsibilities:
//! - Fan each enriched event out to the cache, warehouse and external sinks
//! - Per-sink retry policy, circuit breaker, concurrency budget and
//!   dead-letter path (`SinkHandle`)
//! - Durable `(event, sink)` delivery ledger and per-namespace checkpoints
//! - Live (per-key ordered) and backfill (relaxed) runs of the same
//!   `DispatchCoordinator`
//! - Read-only operator queries
//!
//! ## Usage Example
//!
//! ```ignore
//! let state = PipelineState::open(&blueprint.state)?;
//! let sinks = create_sinks(&blueprint, &state).await?;
//! let parts = CoordinatorParts { reference, sinks, state };
//! let coordinator = DispatchCoordinator::new(CoordinatorSettings::live(&blueprint), parts)?;
//! let report = coordinator.run_live(log, shutdown_rx).await?;
//! ```

pub mod backfill;
pub mod breaker;
pub mod builder;
pub mod checkpoint;
pub mod coordinator;
pub mod dead_letter;
pub mod error;
pub mod handle;
mod journal;
pub mod ledger;
pub mod metrics;
pub mod operator;
pub mod retry;
pub mod sinks;
pub mod state;

pub use backfill::{BackfillController, BackfillRange};
pub use breaker::{Admission, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use builder::{create_sinks, DispatcherBuilder, SinkSet};
pub use checkpoint::{CheckpointStore, WatermarkTracker};
pub use coordinator::{
    CoordinatorParts, CoordinatorSettings, DispatchCoordinator, DispatchMode, OrderingMode,
    RunReport,
};
pub use dead_letter::{replay_dead_letters, DeadLetter, DeadLetterStore, ReplayReport};
pub use error::DispatcherError;
pub use handle::{JobReport, JobResult, SinkHandle, SinkMonitor};
pub use ledger::{DeliveryLedger, LedgerOptions, LedgerSummary};
pub use metrics::{MetricsSnapshot, SinkMetrics};
pub use operator::{
    ComponentHealth, HealthReport, HealthStatus, OperatorRequest, OperatorResponse,
    OperatorSurface, SinkMetricsEntry,
};
pub use retry::RetryPolicy;
pub use state::PipelineState;
