//! Operator surface - read-only queries over a running or stopped pipeline
//!
//! Transport-agnostic: callers either use the methods directly or pass an
//! [`OperatorRequest`] to [`OperatorSurface::handle`] and serialize the
//! [`OperatorResponse`] however they like.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use contracts::{Checkpoint, ContractError, SinkKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::breaker::{BreakerSnapshot, CircuitState};
use crate::builder::SinkSet;
use crate::dead_letter::DeadLetter;
use crate::handle::SinkMonitor;
use crate::ledger::LedgerSummary;
use crate::metrics::MetricsSnapshot;
use crate::sinks::{
    recent_events, AggregationStore, ContentStats, MemoryKeyValueStore, RecentEvent,
};
use crate::state::PipelineState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperatorRequest {
    Checkpoint { namespace: String },
    Checkpoints,
    DeadLetters { sink: Option<SinkKind> },
    CircuitStates,
    SinkMetrics,
    TopContent { limit: usize },
    ContentStats { content_id: Uuid },
    RecentEvents {
        content_id: Uuid,
        #[serde(default = "default_recent_limit")]
        limit: usize,
    },
    LedgerSummary,
    Health,
}

fn default_recent_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkMetricsEntry {
    pub sink: SinkKind,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum OperatorResponse {
    Checkpoint(Option<Checkpoint>),
    Checkpoints(Vec<Checkpoint>),
    DeadLetters(Vec<DeadLetter>),
    CircuitStates(Vec<BreakerSnapshot>),
    SinkMetrics(Vec<SinkMetricsEntry>),
    TopContent(Vec<ContentStats>),
    ContentStats(Option<ContentStats>),
    RecentEvents(Vec<RecentEvent>),
    LedgerSummary(LedgerSummary),
    Health(HealthReport),
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl From<CircuitState> for HealthStatus {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Healthy,
            CircuitState::HalfOpen => Self::Degraded,
            CircuitState::Open => Self::Unhealthy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub detail: String,
}

/// Worst component status wins
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub components: Vec<ComponentHealth>,
}

#[derive(Clone)]
pub struct OperatorSurface {
    state: PipelineState,
    monitors: Vec<SinkMonitor>,
    aggregation: Option<Arc<AggregationStore>>,
    key_value: Option<MemoryKeyValueStore>,
}

impl OperatorSurface {
    pub fn new(state: &PipelineState, sinks: &SinkSet) -> Self {
        Self {
            state: state.clone(),
            monitors: sinks.monitors(),
            aggregation: sinks.aggregation.clone(),
            key_value: sinks.key_value.clone(),
        }
    }

    /// Surface over stored state only; sink and aggregation queries come
    /// back empty.
    pub fn from_state(state: &PipelineState) -> Self {
        Self {
            state: state.clone(),
            monitors: Vec::new(),
            aggregation: None,
            key_value: None,
        }
    }

    pub fn checkpoint(&self, namespace: &str) -> Result<Option<Checkpoint>, ContractError> {
        self.state.checkpoints.load(namespace)
    }

    pub fn checkpoints(&self) -> Result<Vec<Checkpoint>, ContractError> {
        self.state.checkpoints.list()
    }

    pub fn dead_letters(&self, sink: Option<SinkKind>) -> Vec<DeadLetter> {
        match sink {
            Some(sink) => self.state.dead_letters.list_for_sink(sink),
            None => self.state.dead_letters.list(),
        }
    }

    pub fn circuit_states(&self) -> Vec<BreakerSnapshot> {
        self.monitors.iter().map(SinkMonitor::breaker).collect()
    }

    pub fn sink_metrics(&self) -> Vec<SinkMetricsEntry> {
        self.monitors
            .iter()
            .map(|monitor| SinkMetricsEntry {
                sink: monitor.kind(),
                metrics: monitor.metrics(),
            })
            .collect()
    }

    pub fn top_content(&self, limit: usize) -> Vec<ContentStats> {
        self.aggregation
            .as_ref()
            .map(|store| store.top_n(limit))
            .unwrap_or_default()
    }

    pub fn content_stats(&self, content_id: Uuid) -> Option<ContentStats> {
        self.aggregation
            .as_ref()
            .and_then(|store| store.stats_for(content_id))
    }

    /// Newest-first recent events of one content id from the cache store
    pub fn recent_events(
        &self,
        content_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RecentEvent>, ContractError> {
        match &self.key_value {
            Some(store) => recent_events(store, content_id, limit),
            None => Ok(Vec::new()),
        }
    }

    pub fn ledger_summary(&self) -> LedgerSummary {
        self.state.ledger.summary()
    }

    /// Breaker state of every sink plus reachability of the stores
    pub fn health(&self) -> HealthReport {
        let mut components = Vec::new();

        components.push(match self.state.checkpoints.list() {
            Ok(checkpoints) => ComponentHealth {
                component: "checkpoints".into(),
                status: HealthStatus::Healthy,
                detail: format!("{} namespaces", checkpoints.len()),
            },
            Err(e) => ComponentHealth {
                component: "checkpoints".into(),
                status: HealthStatus::Unhealthy,
                detail: e.to_string(),
            },
        });

        let ledger = self.state.ledger.summary();
        components.push(ComponentHealth {
            component: "ledger".into(),
            status: HealthStatus::Healthy,
            detail: format!("{} events, {} pending", ledger.events, ledger.pending),
        });

        if let Some(store) = &self.key_value {
            components.push(ComponentHealth {
                component: "cache_store".into(),
                status: HealthStatus::Healthy,
                detail: format!("{} live keys", store.len()),
            });
        }

        for breaker in self.circuit_states() {
            let detail = match breaker.reopens_in_ms {
                Some(ms) => format!("circuit {}, retry in {ms} ms", breaker.state.as_str()),
                None => format!(
                    "circuit {}, failure rate {:.2}",
                    breaker.state.as_str(),
                    breaker.failure_rate
                ),
            };
            components.push(ComponentHealth {
                component: format!("sink:{}", breaker.sink),
                status: breaker.state.into(),
                detail,
            });
        }

        let status = components
            .iter()
            .map(|component| component.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        HealthReport {
            status,
            checked_at: Utc::now(),
            components,
        }
    }

    pub fn handle(&self, request: OperatorRequest) -> OperatorResponse {
        let result = match request {
            OperatorRequest::Checkpoint { namespace } => {
                self.checkpoint(&namespace).map(OperatorResponse::Checkpoint)
            }
            OperatorRequest::Checkpoints => self.checkpoints().map(OperatorResponse::Checkpoints),
            OperatorRequest::DeadLetters { sink } => {
                Ok(OperatorResponse::DeadLetters(self.dead_letters(sink)))
            }
            OperatorRequest::CircuitStates => {
                Ok(OperatorResponse::CircuitStates(self.circuit_states()))
            }
            OperatorRequest::SinkMetrics => Ok(OperatorResponse::SinkMetrics(self.sink_metrics())),
            OperatorRequest::TopContent { limit } => {
                Ok(OperatorResponse::TopContent(self.top_content(limit)))
            }
            OperatorRequest::ContentStats { content_id } => {
                Ok(OperatorResponse::ContentStats(self.content_stats(content_id)))
            }
            OperatorRequest::RecentEvents { content_id, limit } => self
                .recent_events(content_id, limit)
                .map(OperatorResponse::RecentEvents),
            OperatorRequest::LedgerSummary => {
                Ok(OperatorResponse::LedgerSummary(self.ledger_summary()))
            }
            OperatorRequest::Health => Ok(OperatorResponse::Health(self.health())),
        };
        result.unwrap_or_else(|e| OperatorResponse::Error {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::tests::sample_event;
    use crate::handle::tests::{settings, ScriptedWriter};
    use crate::handle::SinkHandle;
    use chrono::Utc;
    use contracts::{DeliveryState, LIVE_NAMESPACE};
    use std::time::Duration;

    fn surface_with_cache() -> (OperatorSurface, PipelineState, Arc<AggregationStore>, SinkSet) {
        let state = PipelineState::in_memory();
        let aggregation = Arc::new(AggregationStore::new(
            Duration::from_secs(600),
            Duration::from_secs(60),
        ));
        let handle = SinkHandle::spawn(
            ScriptedWriter::new(SinkKind::Cache, vec![]),
            &settings(SinkKind::Cache, 3),
            Arc::clone(&state.ledger),
            Arc::clone(&state.dead_letters),
        );
        let sinks = SinkSet::new(vec![handle]).with_aggregation(Arc::clone(&aggregation));
        (OperatorSurface::new(&state, &sinks), state, aggregation, sinks)
    }

    #[tokio::test]
    async fn test_queries_reflect_state() {
        let (surface, state, aggregation, _sinks) = surface_with_cache();

        state
            .checkpoints
            .save(&Checkpoint::new(LIVE_NAMESPACE, Some(9)))
            .unwrap();
        state
            .dead_letters
            .append(DeadLetter {
                event_id: 3,
                sink: SinkKind::External,
                last_error: "401".into(),
                attempts: 1,
                payload: sample_event(3),
                dead_lettered_at: Utc::now(),
            })
            .unwrap();
        state
            .ledger
            .mark_terminal(3, SinkKind::External, DeliveryState::DeadLettered, 1, Some("401".into()))
            .unwrap();
        let event = sample_event(4);
        aggregation.record(&event);

        assert_eq!(surface.checkpoint(LIVE_NAMESPACE).unwrap().unwrap().offset, Some(9));
        assert_eq!(surface.dead_letters(None).len(), 1);
        assert!(surface.dead_letters(Some(SinkKind::Cache)).is_empty());
        assert_eq!(surface.circuit_states()[0].sink, SinkKind::Cache);
        assert_eq!(surface.sink_metrics()[0].sink, SinkKind::Cache);
        assert_eq!(surface.top_content(5).len(), 1);
        assert_eq!(surface.content_stats(event.content_id).unwrap().events, 1);
        assert_eq!(surface.ledger_summary().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_requests_serialize_round_trip() {
        let (surface, _state, _aggregation, _sinks) = surface_with_cache();
        let request: OperatorRequest =
            serde_json::from_str(r#"{"op":"top_content","limit":3}"#).unwrap();
        assert_eq!(request, OperatorRequest::TopContent { limit: 3 });

        let response = surface.handle(OperatorRequest::Checkpoint {
            namespace: LIVE_NAMESPACE.into(),
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["kind"], "checkpoint");
        assert!(json["data"].is_null());
    }

    #[test]
    fn state_only_surface_has_no_sinks() {
        let surface = OperatorSurface::from_state(&PipelineState::in_memory());
        assert!(surface.circuit_states().is_empty());
        assert!(surface.top_content(10).is_empty());
    }

    #[tokio::test]
    async fn test_recent_events_come_from_the_cache_store() {
        use crate::sinks::CacheSink;
        use contracts::SinkWriter;

        let state = PipelineState::in_memory();
        let kv = MemoryKeyValueStore::new();
        let aggregation = Arc::new(AggregationStore::new(
            Duration::from_secs(600),
            Duration::from_secs(60),
        ));
        let cache = CacheSink::new(kv.clone(), Arc::clone(&aggregation), Duration::from_secs(60));
        for id in 1..=3 {
            cache.deliver(&sample_event(id)).await;
        }
        let sinks = SinkSet::new(Vec::new())
            .with_aggregation(aggregation)
            .with_key_value(kv);
        let surface = OperatorSurface::new(&state, &sinks);

        let content_id = sample_event(1).content_id;
        let request: OperatorRequest = serde_json::from_value(serde_json::json!({
            "op": "recent_events",
            "content_id": content_id,
        }))
        .unwrap();
        assert_eq!(request, OperatorRequest::RecentEvents { content_id, limit: 50 });

        match surface.handle(OperatorRequest::RecentEvents { content_id, limit: 2 }) {
            OperatorResponse::RecentEvents(events) => {
                let ids: Vec<_> = events.iter().map(|event| event.event_id).collect();
                assert_eq!(ids, vec![3, 2]);
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert!(OperatorSurface::from_state(&state)
            .recent_events(content_id, 10)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_health_reports_open_circuit_as_unhealthy() {
        use contracts::{CircuitBreakerConfig, DeliveryOutcome, DeliveryRecord};

        let (surface, _state, _aggregation, _sinks) = surface_with_cache();
        let healthy = surface.health();
        assert_eq!(healthy.status, HealthStatus::Healthy);
        assert!(healthy
            .components
            .iter()
            .any(|c| c.component == "sink:cache" && c.status == HealthStatus::Healthy));

        let state = PipelineState::in_memory();
        let mut config = settings(SinkKind::External, 2);
        config.circuit_breaker = CircuitBreakerConfig {
            window_size: 1,
            min_calls: 1,
            failure_rate_threshold: 1.0,
            cool_down_ms: 60_000,
        };
        let handle = SinkHandle::spawn(
            ScriptedWriter::new(SinkKind::External, [DeliveryOutcome::transient("503")]),
            &config,
            Arc::clone(&state.ledger),
            Arc::clone(&state.dead_letters),
        );
        let reply = handle
            .submit(
                Arc::new(sample_event(1)),
                DeliveryRecord::pending(1, SinkKind::External),
            )
            .await
            .unwrap();
        reply.await.unwrap().unwrap();

        let sinks = SinkSet::new(vec![handle]);
        let report = OperatorSurface::new(&state, &sinks).health();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        let external = report
            .components
            .iter()
            .find(|c| c.component == "sink:external")
            .unwrap();
        assert_eq!(external.status, HealthStatus::Unhealthy);
        assert!(external.detail.contains("open"));

        let json = serde_json::to_value(surface.handle(OperatorRequest::Health)).unwrap();
        assert_eq!(json["kind"], "health");
        assert_eq!(json["data"]["status"], "healthy");
    }
}
