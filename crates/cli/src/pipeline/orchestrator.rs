//! Pipeline orchestrator - wires state, reference data, sinks and the
//! coordinator for one live or backfill run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use contracts::{
    ContentMetadata, EventLog, PipelineBlueprint, ReferenceKind, ReferenceSource, SourceKind,
};
use dispatcher::{
    create_sinks, BackfillController, BackfillRange, CoordinatorParts, CoordinatorSettings,
    DispatchCoordinator, DispatcherError, PipelineState, RunReport,
};
use enrichment::{JsonFileReferenceSource, ReferenceCache, StaticReferenceSource};
use ingestion::{JsonlEventLog, MemoryEventLog};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::PipelineStats;
use crate::error::CliError;

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Validated blueprint, CLI overrides applied
    pub blueprint: PipelineBlueprint,

    /// Stop the run after this long (None = until interrupted)
    pub timeout: Option<Duration>,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

/// What the coordinator reads
#[derive(Debug, Clone, Copy)]
pub enum RunTarget {
    /// Follow the event log from the live checkpoint
    Live,
    /// Re-deliver `[start, end)` under its own checkpoint namespace
    Backfill(BackfillRange),
}

/// Main pipeline orchestrator
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a new pipeline with the given configuration
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Run until the source ends, a signal arrives or the timeout fires
    pub async fn run(self, target: RunTarget) -> Result<PipelineStats> {
        let start_time = Instant::now();
        let blueprint = &self.config.blueprint;

        if let Some(port) = self.config.metrics_port {
            observability::init_metrics_only(port)?;
            info!("Metrics endpoint available on port {}", port);
        }

        let state = PipelineState::open(&blueprint.state)
            .map_err(|e| CliError::open("state directory", e))?;
        let shutdown = Shutdown::install(self.config.timeout);

        let (report, active_sinks) = match blueprint.reference.kind {
            ReferenceKind::JsonFile => {
                let path = blueprint.reference.path.clone().ok_or_else(|| {
                    CliError::missing_setting("reference.path", "required for a json_file source")
                })?;
                self.run_with_reference(JsonFileReferenceSource::new(path), &state, target, &shutdown)
                    .await?
            }
            ReferenceKind::Static => {
                warn!("Static reference source: events will carry no content metadata");
                let source = StaticReferenceSource::new(Vec::<ContentMetadata>::new());
                self.run_with_reference(source, &state, target, &shutdown).await?
            }
        };

        let stats = PipelineStats {
            report,
            duration: start_time.elapsed(),
            active_sinks,
        };
        info!(
            duration_secs = stats.duration.as_secs_f64(),
            events_per_sec = format!("{:.2}", stats.events_per_sec()),
            "Pipeline shutdown complete"
        );
        Ok(stats)
    }

    async fn run_with_reference<R>(
        &self,
        source: R,
        state: &PipelineState,
        target: RunTarget,
        shutdown: &Shutdown,
    ) -> Result<(RunReport, Vec<contracts::SinkKind>)>
    where
        R: ReferenceSource + Sync + 'static,
    {
        let blueprint = &self.config.blueprint;

        info!("Loading reference data...");
        let reference = Arc::new(ReferenceCache::new(source, blueprint.reference.fetch_on_miss));
        if !reference.refresh().await {
            warn!("Initial reference load failed, starting with an empty snapshot");
        }
        let refresh_task = reference.spawn_refresh_loop(
            Duration::from_secs(blueprint.reference.refresh_interval_secs),
            shutdown.subscribe(),
        );

        info!("Setting up sinks...");
        let sinks = create_sinks(blueprint, state).await?;
        let active_sinks = sinks.kinds();
        let eviction_task = sinks.aggregation.as_ref().map(|store| {
            store.spawn_eviction_loop(
                Duration::from_secs(blueprint.sinks.cache.eviction_interval_secs),
                shutdown.subscribe(),
            )
        });
        info!(sinks = ?active_sinks, "Sinks started");

        let parts = CoordinatorParts {
            reference,
            sinks,
            state: state.clone(),
        };
        let result = match blueprint.source.kind {
            SourceKind::Jsonl => {
                let log = JsonlEventLog::open(&blueprint.source.path)
                    .await
                    .map_err(|e| CliError::open("event log", e))?
                    .with_poll_interval(Duration::from_millis(blueprint.source.poll_interval_ms));
                info!(path = %blueprint.source.path.display(), "Event log opened");
                self.dispatch(Arc::new(log), parts, target, shutdown.subscribe())
                    .await
            }
            SourceKind::Memory => {
                warn!("In-memory source: nothing to read until events are appended in-process");
                self.dispatch(Arc::new(MemoryEventLog::new()), parts, target, shutdown.subscribe())
                    .await
            }
        };

        // The coordinator is done either way; stop the background loops.
        shutdown.trigger();
        for task in std::iter::once(refresh_task).chain(eviction_task) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let report = result.map_err(CliError::from)?;
        Ok((report, active_sinks))
    }

    async fn dispatch<R, L>(
        &self,
        log: Arc<L>,
        parts: CoordinatorParts<R>,
        target: RunTarget,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunReport, DispatcherError>
    where
        R: ReferenceSource + Sync + 'static,
        L: EventLog + Sync + 'static,
    {
        let blueprint = &self.config.blueprint;
        match target {
            RunTarget::Live => {
                let coordinator =
                    DispatchCoordinator::new(CoordinatorSettings::live(blueprint), parts)?;
                info!(from_offset = coordinator.resume_offset(), "Pipeline running (live)");
                coordinator.run_live(log, shutdown).await
            }
            RunTarget::Backfill(range) => {
                info!(namespace = %range.namespace(), "Pipeline running (backfill)");
                BackfillController::new(log, blueprint.clone())
                    .run(range, parts, shutdown)
                    .await
            }
        }
    }
}

/// Shutdown signal shared by the coordinator and the background loops.
/// Flips on Ctrl+C, SIGTERM, the optional timeout, or [`Shutdown::trigger`].
struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    watchers: Vec<JoinHandle<()>>,
}

impl Shutdown {
    fn install(timeout: Option<Duration>) -> Self {
        let (tx, _rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let mut watchers = Vec::new();

        let signal_tx = Arc::clone(&tx);
        watchers.push(tokio::spawn(async move {
            wait_for_signal().await;
            warn!("Received shutdown signal, draining in-flight events...");
            signal_tx.send_replace(true);
        }));

        if let Some(timeout) = timeout {
            let timeout_tx = Arc::clone(&tx);
            watchers.push(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                info!(timeout_secs = timeout.as_secs(), "Run timeout reached, stopping");
                timeout_tx.send_replace(true);
            }));
        }

        Self { tx, watchers }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM. A handler that cannot be installed never
/// resolves.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
