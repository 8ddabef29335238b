//! Shared fixtures: event builders, a scripted sink writer and run helpers

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use contracts::{
    ContentMetadata, ContentType, ContractError, DeliveryOutcome, EnrichedEvent, EventId,
    EventType, PipelineBlueprint, RawEvent, RetryConfig, SinkKind, SinkWriter, SinksConfig,
    WarehouseTableKind,
};
use dispatcher::{
    CoordinatorParts, CoordinatorSettings, DispatchCoordinator, PipelineState, RunReport,
    SinkHandle, SinkSet,
};
use enrichment::{ReferenceCache, StaticReferenceSource};
use ingestion::{HistoricalRange, MemoryEventLog};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

pub fn content_id(key: u64) -> Uuid {
    Uuid::from_u128(0xC0_0000 + key as u128)
}

fn base_ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// `count` events with ids `1..=count`, spread round-robin over `keys`
/// content ids, one second apart
pub fn events(count: u64, keys: u64) -> Vec<RawEvent> {
    (1..=count)
        .map(|id| {
            let event_type = EventType::ALL[(id % 4) as usize];
            RawEvent {
                id,
                content_id: content_id((id - 1) % keys),
                user_id: Uuid::from_u128(0xA0_0000 + (id % 37) as u128),
                event_type,
                event_ts: base_ts() + chrono::Duration::seconds(id as i64),
                duration_ms: event_type.expects_duration().then_some(30_000),
                device: Some("web-chrome".into()),
                extra: None,
            }
        })
        .collect()
}

pub fn catalog(keys: u64) -> Arc<ReferenceCache<StaticReferenceSource>> {
    let entries = (0..keys).map(|key| ContentMetadata {
        content_id: content_id(key),
        slug: format!("content-{key}"),
        title: format!("Content {key}"),
        content_type: ContentType::Video,
        length_seconds: Some(600),
    });
    Arc::new(ReferenceCache::new(StaticReferenceSource::new(entries), true))
}

/// Default blueprint with millisecond retries and small warehouse batches
pub fn fast_blueprint() -> PipelineBlueprint {
    let mut blueprint = PipelineBlueprint::default();
    blueprint.dispatch.checkpoint_interval_ms = 10;
    blueprint.dispatch.shutdown_grace_secs = 1;
    blueprint.sinks = fast_sinks(blueprint.sinks);
    blueprint
}

fn fast_sinks(mut sinks: SinksConfig) -> SinksConfig {
    let retry = RetryConfig::new(5, 1, 5);
    sinks.cache.retry = retry.clone();
    sinks.warehouse.retry = retry.clone();
    sinks.external.retry = retry;
    sinks.warehouse.table = WarehouseTableKind::Memory;
    sinks.warehouse.max_batch_ms = 2;
    sinks
}

/// One observed call of a [`ScriptedSink`]
#[derive(Debug, Clone, Copy)]
pub struct Call {
    pub event_id: EventId,
    /// 1-based attempt of this event at this sink
    pub attempt: u32,
    /// 0-based position among all calls of the sink
    pub index: usize,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Deliver,
    Transient,
    Permanent,
    /// Never return, like a request stuck on a dead connection
    Hang,
}

#[derive(Debug, Default)]
struct RecorderInner {
    attempts: HashMap<EventId, u32>,
    calls: Vec<Call>,
    delivered: Vec<EventId>,
}

/// What a scripted sink saw, shared with the test body
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<RecorderInner>>,
}

impl Recorder {
    fn begin(&self, event_id: EventId) -> Call {
        let mut inner = self.inner.lock().unwrap();
        let attempt = inner.attempts.entry(event_id).or_default();
        *attempt += 1;
        let call = Call {
            event_id,
            attempt: *attempt,
            index: inner.calls.len(),
            at: Instant::now(),
        };
        inner.calls.push(call);
        call
    }

    fn delivered(&self, event_id: EventId) {
        self.inner.lock().unwrap().delivered.push(event_id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Ids in the order their deliveries completed
    pub fn delivered_ids(&self) -> Vec<EventId> {
        self.inner.lock().unwrap().delivered.clone()
    }

    /// Ids delivered more than once
    pub fn duplicates(&self) -> Vec<EventId> {
        let mut seen = HashMap::new();
        for id in self.delivered_ids() {
            *seen.entry(id).or_insert(0u32) += 1;
        }
        let mut dups: Vec<_> = seen.into_iter().filter(|(_, n)| *n > 1).map(|(id, _)| id).collect();
        dups.sort_unstable();
        dups
    }
}

type Plan = Arc<dyn Fn(&Call) -> Step + Send + Sync>;
type Delay = Arc<dyn Fn(EventId) -> Duration + Send + Sync>;

/// Sink writer whose outcome per call comes from a closure
#[derive(Clone)]
pub struct ScriptedSink {
    kind: SinkKind,
    plan: Plan,
    delay: Delay,
    pub recorder: Recorder,
}

impl ScriptedSink {
    pub fn new(kind: SinkKind, plan: impl Fn(&Call) -> Step + Send + Sync + 'static) -> Self {
        Self {
            kind,
            plan: Arc::new(plan),
            delay: Arc::new(|_| Duration::ZERO),
            recorder: Recorder::default(),
        }
    }

    pub fn healthy(kind: SinkKind) -> Self {
        Self::new(kind, |_| Step::Deliver)
    }

    pub fn with_delay(mut self, delay: impl Fn(EventId) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Arc::new(delay);
        self
    }
}

impl SinkWriter for ScriptedSink {
    fn kind(&self) -> SinkKind {
        self.kind
    }

    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn deliver(&self, event: &EnrichedEvent) -> DeliveryOutcome {
        let call = self.recorder.begin(event.id);
        let delay = (self.delay)(event.id);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match (self.plan)(&call) {
            Step::Deliver => {
                self.recorder.delivered(event.id);
                DeliveryOutcome::Delivered
            }
            Step::Transient => DeliveryOutcome::transient("injected transient failure"),
            Step::Permanent => DeliveryOutcome::permanent("injected permanent failure"),
            Step::Hang => std::future::pending().await,
        }
    }

    async fn flush(&self) -> Result<(), ContractError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ContractError> {
        Ok(())
    }
}

pub fn spawn<W>(writer: W, blueprint: &PipelineBlueprint, state: &PipelineState) -> SinkHandle
where
    W: SinkWriter + Sync + 'static,
{
    let kind = writer.kind();
    SinkHandle::spawn(
        writer,
        &blueprint.sinks.delivery(kind),
        Arc::clone(&state.ledger),
        Arc::clone(&state.dead_letters),
    )
}

/// Run a live-mode (per-key ordered) coordinator over everything in `log`
/// that the checkpoint has not covered yet, then stop.
pub async fn run_to_end(
    blueprint: &PipelineBlueprint,
    log: &Arc<MemoryEventLog>,
    sinks: SinkSet,
    state: &PipelineState,
    keys: u64,
) -> RunReport {
    let coordinator = DispatchCoordinator::new(
        CoordinatorSettings::live(blueprint),
        CoordinatorParts {
            reference: catalog(keys),
            sinks,
            state: state.clone(),
        },
    )
    .unwrap();
    let source = whole_log(log, coordinator.resume_offset()).await;
    let (_tx, rx) = watch::channel(false);
    coordinator.run(source, rx).await.unwrap()
}

/// Bounded source over the whole log from `from_offset`
pub async fn whole_log(log: &Arc<MemoryEventLog>, from_offset: u64) -> HistoricalRange<MemoryEventLog> {
    HistoricalRange::open(
        Arc::clone(log),
        Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap(),
        from_offset,
    )
    .await
    .unwrap()
}

/// Poll `condition` every few milliseconds until it holds
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
