//! Circuit breaker: fail fast while open, one trial call after the cool-down,
//! and every rejection spends one attempt of the event's retry budget.

use std::sync::Arc;
use std::time::Duration;

use contracts::{CircuitBreakerConfig, RetryConfig, SinkKind};
use dispatcher::{CircuitState, PipelineState, SinkSet};
use ingestion::MemoryEventLog;

use crate::support::{events, fast_blueprint, run_to_end, spawn, ScriptedSink, Step};

#[tokio::test(start_paused = true)]
async fn test_open_breaker_waits_for_cool_down_then_tries_once() {
    let mut blueprint = fast_blueprint();
    blueprint.sinks.external.enabled = true;
    blueprint.sinks.external.retry = RetryConfig {
        jitter: 0.0,
        ..RetryConfig::new(10, 10, 100)
    };
    blueprint.sinks.external.circuit_breaker = CircuitBreakerConfig {
        window_size: 5,
        min_calls: 5,
        failure_rate_threshold: 0.5,
        cool_down_ms: 1_000,
    };
    let state = PipelineState::in_memory();
    // Both events land on the same key
    let log = Arc::new(MemoryEventLog::from_events(events(2, 1)));

    let external = ScriptedSink::new(SinkKind::External, |call| {
        if call.index < 5 {
            Step::Transient
        } else {
            Step::Deliver
        }
    });
    let handle = spawn(external.clone(), &blueprint, &state);
    let monitor = handle.monitor();
    let report = run_to_end(&blueprint, &log, SinkSet::new(vec![handle]), &state, 1).await;

    assert_eq!(report.delivered(SinkKind::External), 2);
    assert_eq!(report.dead_lettered(SinkKind::External), 0);

    let calls = external.recorder.calls();
    assert_eq!(calls.len(), 7);
    // Five failures open the breaker; the next call is the half-open trial
    assert!(calls[5].at - calls[4].at >= Duration::from_secs(1));
    assert_eq!(calls[5].event_id, 1);
    assert_eq!(calls[6].event_id, 2);
    assert_eq!(monitor.breaker().state, CircuitState::Closed);

    // Five failures, one rejection during the cool-down, then the trial call
    let attempts = |id| state.ledger.get(id, SinkKind::External).map(|r| r.attempt_count);
    assert_eq!(attempts(1), Some(7));
    assert_eq!(attempts(2), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_the_breaker() {
    let mut blueprint = fast_blueprint();
    blueprint.sinks.external.enabled = true;
    blueprint.sinks.external.retry = RetryConfig {
        jitter: 0.0,
        ..RetryConfig::new(10, 10, 50)
    };
    blueprint.sinks.external.circuit_breaker = CircuitBreakerConfig {
        window_size: 3,
        min_calls: 3,
        failure_rate_threshold: 0.5,
        cool_down_ms: 500,
    };
    let state = PipelineState::in_memory();
    let log = Arc::new(MemoryEventLog::from_events(events(1, 1)));

    // Three failures open it, the first trial fails, the second succeeds
    let external = ScriptedSink::new(SinkKind::External, |call| {
        if call.index < 4 {
            Step::Transient
        } else {
            Step::Deliver
        }
    });
    let handle = spawn(external.clone(), &blueprint, &state);
    let report = run_to_end(&blueprint, &log, SinkSet::new(vec![handle]), &state, 1).await;

    assert_eq!(report.delivered(SinkKind::External), 1);
    let calls = external.recorder.calls();
    assert_eq!(calls.len(), 5);
    assert!(calls[3].at - calls[2].at >= Duration::from_millis(500));
    assert!(calls[4].at - calls[3].at >= Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_dead_destination_dead_letters_every_event_promptly() {
    let mut blueprint = fast_blueprint();
    blueprint.sinks.external.enabled = true;
    blueprint.sinks.external.retry = RetryConfig {
        jitter: 0.0,
        ..RetryConfig::new(2, 10, 100)
    };
    blueprint.sinks.external.circuit_breaker = CircuitBreakerConfig {
        window_size: 1,
        min_calls: 1,
        failure_rate_threshold: 1.0,
        cool_down_ms: 1_000,
    };
    let state = PipelineState::in_memory();
    let log = Arc::new(MemoryEventLog::from_events(events(20, 20)));

    let external = ScriptedSink::new(SinkKind::External, |_| Step::Transient);
    let handle = spawn(external.clone(), &blueprint, &state);
    let started = tokio::time::Instant::now();
    let report = run_to_end(&blueprint, &log, SinkSet::new(vec![handle]), &state, 20).await;

    assert_eq!(report.events_completed, 20);
    assert_eq!(report.dead_lettered(SinkKind::External), 20);
    assert_eq!(report.checkpoint, Some(19));
    assert!(started.elapsed() < Duration::from_secs(5));
    // Most events never reach the destination once the circuit is open
    assert!(external.recorder.calls().len() < 40);
    assert!(state.ledger.pending().is_empty());
}
