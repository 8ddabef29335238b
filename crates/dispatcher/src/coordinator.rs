//! Dispatch coordinator
//!
//! Pulls records from an [`EventSource`], enriches each event, fans it out to
//! every sink and advances the namespace checkpoint once all sinks hold a
//! terminal ledger record for it.
//!
//! Live and backfill runs are the same loop configured differently:
//! - `OrderingMode::PerKey`: one worker per partition key, events of a key
//!   strictly in source order
//! - `OrderingMode::Relaxed`: one task per event, no ordering
//!
//! Every event holds a permit of the in-flight budget from dispatch until
//! the main loop has accounted for its completion.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use contracts::{
    backfill_namespace, Checkpoint, EventLog, EventSource, PartitionBy, PartitionKey,
    PipelineBlueprint, ReferenceSource, SinkKind, SourceOffset, SourceRecord, LIVE_NAMESPACE,
};
use enrichment::{enrich, ReferenceCache};
use futures::future::join_all;
use ingestion::LiveTail;
use observability::{DeliverySummary, PipelineStatsAggregator};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::builder::SinkSet;
use crate::checkpoint::WatermarkTracker;
use crate::error::DispatcherError;
use crate::handle::{JobReport, SinkHandle};
use crate::ledger::DeliveryLedger;
use crate::operator::OperatorSurface;
use crate::state::PipelineState;

const SOURCE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Live,
    /// Historical range `[start, end)`
    Backfill {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl DispatchMode {
    pub fn namespace(&self) -> String {
        match self {
            Self::Live => LIVE_NAMESPACE.to_string(),
            Self::Backfill { start, end } => backfill_namespace(*start, *end),
        }
    }

    pub fn ordering(&self) -> OrderingMode {
        match self {
            Self::Live => OrderingMode::PerKey,
            Self::Backfill { .. } => OrderingMode::Relaxed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingMode {
    PerKey,
    Relaxed,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub namespace: String,
    pub ordering: OrderingMode,
    /// Events between the source and all-sinks-terminal
    pub max_in_flight: usize,
    pub key_queue_capacity: usize,
    pub batch_size: usize,
    pub checkpoint_interval: Duration,
    pub shutdown_grace: Duration,
    pub partition_by: PartitionBy,
}

impl CoordinatorSettings {
    pub fn new(mode: DispatchMode, blueprint: &PipelineBlueprint) -> Self {
        let dispatch = &blueprint.dispatch;
        let (max_in_flight, batch_size) = match mode {
            DispatchMode::Live => (dispatch.max_in_flight, blueprint.source.batch_size),
            DispatchMode::Backfill { .. } => {
                (blueprint.backfill.concurrency, blueprint.backfill.batch_size)
            }
        };
        Self {
            namespace: mode.namespace(),
            ordering: mode.ordering(),
            max_in_flight: max_in_flight.max(1),
            key_queue_capacity: dispatch.key_queue_capacity.max(1),
            batch_size: batch_size.max(1),
            checkpoint_interval: Duration::from_millis(dispatch.checkpoint_interval_ms.max(1)),
            shutdown_grace: Duration::from_secs(dispatch.shutdown_grace_secs),
            partition_by: blueprint.source.partition_by,
        }
    }

    pub fn live(blueprint: &PipelineBlueprint) -> Self {
        Self::new(DispatchMode::Live, blueprint)
    }

    pub fn backfill(blueprint: &PipelineBlueprint, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(DispatchMode::Backfill { start, end }, blueprint)
    }
}

/// Runtime pieces a coordinator drives
pub struct CoordinatorParts<R> {
    pub reference: Arc<ReferenceCache<R>>,
    pub sinks: SinkSet,
    pub state: PipelineState,
}

/// Summary of one coordinator run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub namespace: String,
    pub events_observed: u64,
    pub events_completed: u64,
    /// Re-observed events that were already terminal at every sink
    pub already_terminal: u64,
    /// In-flight events left pending when the shutdown grace expired
    pub abandoned: usize,
    pub checkpoint: Option<SourceOffset>,
    pub summary: DeliverySummary,
}

impl RunReport {
    pub fn delivered(&self, sink: SinkKind) -> u64 {
        self.summary.delivered(sink)
    }

    pub fn dead_lettered(&self, sink: SinkKind) -> u64 {
        self.summary.dead_lettered(sink)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "namespace: {}", self.namespace)?;
        writeln!(
            f,
            "events: observed={} completed={} already_terminal={} abandoned={}",
            self.events_observed, self.events_completed, self.already_terminal, self.abandoned
        )?;
        match self.checkpoint {
            Some(offset) => writeln!(f, "checkpoint: {offset}")?,
            None => writeln!(f, "checkpoint: none")?,
        }
        write!(f, "{}", self.summary)
    }
}

/// Result of fanning one event out
#[derive(Debug)]
struct EventOutcome {
    already_terminal: bool,
    jobs: Vec<JobReport>,
}

/// Shared by every per-key worker and relaxed task
struct FanOut<R> {
    reference: Arc<ReferenceCache<R>>,
    sinks: Vec<SinkHandle>,
    kinds: Vec<SinkKind>,
    ledger: Arc<DeliveryLedger>,
}

impl<R: ReferenceSource + Sync> FanOut<R> {
    #[instrument(
        name = "coordinator_fan_out",
        skip(self, record),
        fields(offset = record.offset, event_id = record.event.id)
    )]
    async fn process(&self, record: &SourceRecord) -> Result<EventOutcome, DispatcherError> {
        let raw = &record.event;
        if self.ledger.all_terminal(raw.id, &self.kinds) {
            debug!("Event already terminal at every sink");
            return Ok(EventOutcome {
                already_terminal: true,
                jobs: Vec::new(),
            });
        }

        let metadata = self.reference.get_or_fetch(raw.content_id).await;
        if metadata.is_none() {
            observability::record_enrichment_miss();
            debug!(content_id = %raw.content_id, "No reference metadata, forwarding without it");
        }
        let event = Arc::new(enrich(raw, metadata.as_deref(), Utc::now()));

        let mut replies = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let kind = sink.kind();
            if self.ledger.is_terminal(event.id, kind) {
                trace!(sink = %kind, "Sink already terminal, skipping");
                continue;
            }
            let prior = self.ledger.open_record(event.id, kind);
            replies.push(sink.submit(Arc::clone(&event), prior).await?);
        }

        let mut jobs = Vec::with_capacity(replies.len());
        for reply in join_all(replies).await {
            let report = reply.map_err(|_| {
                DispatcherError::Worker("delivery job dropped before reaching a terminal state".into())
            })??;
            jobs.push(report);
        }
        Ok(EventOutcome {
            already_terminal: false,
            jobs,
        })
    }
}

struct WorkItem {
    record: SourceRecord,
    permit: OwnedSemaphorePermit,
}

struct Completion {
    offset: SourceOffset,
    key: Option<PartitionKey>,
    result: Result<EventOutcome, DispatcherError>,
    /// Released once the main loop has accounted for the event
    _permit: OwnedSemaphorePermit,
}

/// Main-loop side of one key worker. Items that do not fit the worker's
/// channel wait in `parked`, so a stuck key never blocks the main loop.
struct KeyQueue {
    tx: mpsc::Sender<WorkItem>,
    parked: VecDeque<WorkItem>,
    /// Dispatched events of this key not yet accounted for
    outstanding: usize,
}

impl KeyQueue {
    fn push(&mut self, key: PartitionKey, item: WorkItem) -> Result<(), DispatcherError> {
        self.outstanding += 1;
        self.parked.push_back(item);
        self.fill(key)
    }

    /// Move parked items into the worker channel while it has room
    fn fill(&mut self, key: PartitionKey) -> Result<(), DispatcherError> {
        while let Some(item) = self.parked.pop_front() {
            match self.tx.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    self.parked.push_front(item);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    return Err(DispatcherError::Worker(format!("worker for key {key} stopped")));
                }
            }
        }
        Ok(())
    }
}

pub struct DispatchCoordinator<R> {
    settings: CoordinatorSettings,
    fanout: FanOut<R>,
    state: PipelineState,
    operator: OperatorSurface,
    committed: Option<SourceOffset>,
}

impl<R> DispatchCoordinator<R>
where
    R: ReferenceSource + Sync + 'static,
{
    /// Load the namespace checkpoint and assemble the coordinator.
    #[instrument(name = "coordinator_new", skip_all, fields(namespace = %settings.namespace))]
    pub fn new(settings: CoordinatorSettings, parts: CoordinatorParts<R>) -> Result<Self, DispatcherError> {
        let CoordinatorParts {
            reference,
            sinks,
            state,
        } = parts;
        if sinks.handles.is_empty() {
            return Err(DispatcherError::NoSinks);
        }

        let committed = state
            .checkpoints
            .load(&settings.namespace)?
            .and_then(|checkpoint| checkpoint.offset);
        let operator = OperatorSurface::new(&state, &sinks);
        let kinds = sinks.kinds();

        info!(
            ?committed,
            sinks = ?kinds,
            ordering = ?settings.ordering,
            "Dispatch coordinator ready"
        );
        Ok(Self {
            fanout: FanOut {
                reference,
                sinks: sinks.handles,
                kinds,
                ledger: Arc::clone(&state.ledger),
            },
            settings,
            state,
            operator,
            committed,
        })
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// First source offset this run should read
    pub fn resume_offset(&self) -> SourceOffset {
        self.committed.map_or(0, |offset| offset + 1)
    }

    pub fn operator(&self) -> OperatorSurface {
        self.operator.clone()
    }

    /// Follow `log` from the checkpoint until `shutdown` flips to `true`.
    pub async fn run_live<L>(
        self,
        log: Arc<L>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunReport, DispatcherError>
    where
        L: EventLog + Sync + 'static,
    {
        let source = LiveTail::new(log, self.resume_offset());
        self.run(source, shutdown).await
    }

    /// Drive `source` until it ends, `shutdown` flips to `true`, or a fatal
    /// storage error occurs.
    ///
    /// On shutdown, in-flight events get `shutdown_grace` to become terminal.
    /// Whatever is still running after that is abandoned with its ledger
    /// records pending, so the next run resumes it.
    #[instrument(
        name = "coordinator_run",
        skip_all,
        fields(namespace = %self.settings.namespace, source = source.name())
    )]
    pub async fn run<S: EventSource>(
        self,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunReport, DispatcherError> {
        let Self {
            settings,
            fanout,
            state,
            committed,
            ..
        } = self;
        info!(resume_offset = committed.map_or(0, |o| o + 1), "Dispatch started");

        let (done_tx, done_rx) = mpsc::channel(settings.max_in_flight);
        let mut ticker = tokio::time::interval(settings.checkpoint_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut run = RunLoop {
            permits: Arc::new(Semaphore::new(settings.max_in_flight)),
            fanout: Arc::new(fanout),
            done_tx,
            done_rx,
            workers: JoinSet::new(),
            keys: HashMap::new(),
            tracker: WatermarkTracker::new(committed),
            stats: PipelineStatsAggregator::new(),
            report: RunReport {
                namespace: settings.namespace.clone(),
                checkpoint: committed,
                ..RunReport::default()
            },
            dirty: false,
            state,
            settings,
        };

        let mut exhausted = false;
        let mut stopping = *shutdown.borrow();
        let mut fatal: Option<DispatcherError> = None;

        while fatal.is_none() && !stopping {
            if exhausted && run.tracker.in_flight() == 0 {
                break;
            }
            // Never pull more than the free in-flight budget, so dispatching
            // a batch cannot wait on completions.
            let budget = run.permits.available_permits().min(run.settings.batch_size);
            let can_pull = !exhausted && budget > 0;

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(in_flight = run.tracker.in_flight(), "Shutdown requested, no longer pulling");
                        stopping = true;
                    }
                }

                Some(completion) = run.done_rx.recv() => {
                    if let Err(e) = run.complete(completion) {
                        fatal = Some(e);
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = run.persist() {
                        fatal = Some(e);
                    }
                }

                batch = source.next_batch(budget), if can_pull => {
                    match batch {
                        Ok(Some(records)) => {
                            for record in records {
                                if let Err(e) = run.dispatch(record).await {
                                    fatal = Some(e);
                                    break;
                                }
                            }
                        }
                        Ok(None) => {
                            info!(in_flight = run.tracker.in_flight(), "Source exhausted, draining");
                            exhausted = true;
                        }
                        Err(e) if e.is_fatal() => fatal = Some(e.into()),
                        Err(e) => {
                            warn!(error = %e, "Source read failed, retrying");
                            tokio::time::sleep(SOURCE_RETRY_DELAY).await;
                        }
                    }
                }
            }
        }

        if let Some(e) = fatal {
            error!(error = %e, "Fatal error, stopping dispatch");
            run.abort().await;
            return Err(e);
        }

        let deadline = Instant::now() + run.settings.shutdown_grace;
        while run.tracker.in_flight() > 0 {
            match tokio::time::timeout_at(deadline, run.done_rx.recv()).await {
                Ok(Some(completion)) => {
                    if let Err(e) = run.complete(completion) {
                        error!(error = %e, "Fatal error while draining");
                        run.abort().await;
                        return Err(e);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    run.report.abandoned = run.tracker.in_flight();
                    warn!(
                        abandoned = run.report.abandoned,
                        "Shutdown grace expired, leaving in-flight events pending"
                    );
                    break;
                }
            }
        }

        run.finish(deadline).await
    }
}

/// Mutable state of one `run` call
struct RunLoop<R> {
    settings: CoordinatorSettings,
    permits: Arc<Semaphore>,
    fanout: Arc<FanOut<R>>,
    done_tx: mpsc::Sender<Completion>,
    done_rx: mpsc::Receiver<Completion>,
    workers: JoinSet<()>,
    keys: HashMap<PartitionKey, KeyQueue>,
    tracker: WatermarkTracker,
    stats: PipelineStatsAggregator,
    report: RunReport,
    dirty: bool,
    state: PipelineState,
}

impl<R> RunLoop<R>
where
    R: ReferenceSource + Sync + 'static,
{
    async fn dispatch(&mut self, record: SourceRecord) -> Result<(), DispatcherError> {
        // Completions hold their permits until accounted for here
        let permit = loop {
            if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
                break permit;
            }
            match self.done_rx.recv().await {
                Some(completion) => self.complete(completion)?,
                None => return Err(DispatcherError::Worker("completion channel closed".into())),
            }
        };

        self.tracker.observe(record.offset);
        self.report.events_observed += 1;
        observability::record_event_received(&self.settings.namespace);

        match self.settings.ordering {
            OrderingMode::Relaxed => {
                let fanout = Arc::clone(&self.fanout);
                let done = self.done_tx.clone();
                self.workers.spawn(async move {
                    let offset = record.offset;
                    let result = fanout.process(&record).await;
                    let _ = done
                        .send(Completion {
                            offset,
                            key: None,
                            result,
                            _permit: permit,
                        })
                        .await;
                });
            }
            OrderingMode::PerKey => {
                let key = record.event.partition_key(self.settings.partition_by);
                let queue = self.keys.entry(key).or_insert_with(|| {
                    spawn_key_worker(
                        &mut self.workers,
                        key,
                        Arc::clone(&self.fanout),
                        self.done_tx.clone(),
                        self.settings.key_queue_capacity,
                    )
                });
                queue.push(key, WorkItem { record, permit })?;
            }
        }

        observability::record_events_in_flight(self.tracker.in_flight());
        Ok(())
    }

    fn complete(&mut self, completion: Completion) -> Result<(), DispatcherError> {
        let Completion {
            offset,
            key,
            result,
            _permit,
        } = completion;

        if let Some(key) = key {
            if let Some(queue) = self.keys.get_mut(&key) {
                queue.outstanding = queue.outstanding.saturating_sub(1);
                if queue.outstanding == 0 {
                    // Dropping the sender lets the idle worker exit
                    self.keys.remove(&key);
                } else {
                    queue.fill(key)?;
                }
            }
        }

        let outcome = result?;
        if outcome.already_terminal {
            self.report.already_terminal += 1;
        }
        for job in &outcome.jobs {
            self.stats.record_terminal(
                job.sink,
                job.delivered(),
                job.attempts,
                job.latency.as_secs_f64() * 1000.0,
            );
        }
        self.report.events_completed += 1;

        if let Some(watermark) = self.tracker.complete(offset) {
            trace!(watermark, "Watermark advanced");
            self.dirty = true;
        }
        observability::record_events_in_flight(self.tracker.in_flight());
        Ok(())
    }

    /// Write the checkpoint if the watermark moved since the last write
    fn persist(&mut self) -> Result<(), DispatcherError> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(offset) = self.tracker.watermark() {
            self.state
                .checkpoints
                .save(&Checkpoint::new(self.settings.namespace.clone(), Some(offset)))?;
            debug!(offset, "Checkpoint saved");
        }
        self.dirty = false;
        Ok(())
    }

    async fn stop_workers(&mut self) {
        self.keys.clear();
        self.workers.abort_all();
        while self.workers.join_next().await.is_some() {}
    }

    /// Stop every task without draining. Sink jobs are aborted with the
    /// handles.
    async fn abort(mut self) {
        self.stop_workers().await;
    }

    async fn finish(mut self, deadline: Instant) -> Result<RunReport, DispatcherError> {
        self.stop_workers().await;
        self.persist()?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        match Arc::try_unwrap(self.fanout) {
            Ok(fanout) => {
                let closed = join_all(
                    fanout
                        .sinks
                        .into_iter()
                        .map(|sink| sink.shutdown_within(remaining)),
                )
                .await;
                if closed.iter().any(|clean| !clean) {
                    warn!("Some sinks were closed before their deliveries finished");
                }
            }
            Err(_) => warn!("Sink handles still shared at shutdown, aborting them"),
        }

        self.report.checkpoint = self.tracker.watermark();
        self.report.summary = self.stats.summary();
        info!(
            observed = self.report.events_observed,
            completed = self.report.events_completed,
            checkpoint = ?self.report.checkpoint,
            "Dispatch finished"
        );
        Ok(self.report)
    }
}

fn spawn_key_worker<R>(
    workers: &mut JoinSet<()>,
    key: PartitionKey,
    fanout: Arc<FanOut<R>>,
    done: mpsc::Sender<Completion>,
    capacity: usize,
) -> KeyQueue
where
    R: ReferenceSource + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<WorkItem>(capacity);
    workers.spawn(async move {
        trace!(%key, "Key worker started");
        while let Some(item) = rx.recv().await {
            let offset = item.record.offset;
            let result = fanout.process(&item.record).await;
            let failed = result.is_err();
            let completion = Completion {
                offset,
                key: Some(key),
                result,
                _permit: item.permit,
            };
            if done.send(completion).await.is_err() || failed {
                break;
            }
        }
        trace!(%key, "Key worker stopped");
    });
    KeyQueue {
        tx,
        parked: VecDeque::new(),
        outstanding: 0,
    }
}
