//! Per-sink circuit breaker
//!
//! Tracks a rolling window of recent call outcomes. A rejected admission
//! counts as a retryable failure against the event's retry budget and
//! defers the next attempt until at least the end of the cool-down.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use contracts::{CircuitBreakerConfig, DeliveryOutcome, SinkKind};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Wait handed to rejected callers while a trial is in flight
const TRIAL_WAIT_CEILING: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding
    fn level(&self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision for one prospective call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead. `trial` is set for the single half-open trial call.
    Allowed { trial: bool },
    /// Fail fast; try again after `retry_after`.
    Rejected { retry_after: Duration },
}

/// Point-in-time view for the operator surface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub sink: SinkKind,
    pub state: CircuitState,
    pub failure_rate: f64,
    pub window_len: usize,
    /// Remaining cool-down while open
    pub reopens_in_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// `true` = failure
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 / self.window.len() as f64
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    sink: SinkKind,
    window_size: usize,
    min_calls: usize,
    failure_rate_threshold: f64,
    cool_down: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(sink: SinkKind, config: &CircuitBreakerConfig) -> Self {
        let window_size = config.window_size.max(1);
        Self {
            sink,
            window_size,
            min_calls: config.min_calls.clamp(1, window_size),
            failure_rate_threshold: config.failure_rate_threshold,
            cool_down: Duration::from_millis(config.cool_down_ms),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(window_size),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn sink(&self) -> SinkKind {
        self.sink
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask whether a call may proceed. Moves an open breaker whose cool-down
    /// elapsed to half-open and admits exactly one trial.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed { trial: false },
            CircuitState::Open => {
                let reopen_at = inner.opened_at.unwrap_or_else(Instant::now) + self.cool_down;
                let now = Instant::now();
                if now >= reopen_at {
                    inner.trial_in_flight = true;
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    Admission::Allowed { trial: true }
                } else {
                    Admission::Rejected {
                        retry_after: reopen_at - now,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected {
                        retry_after: self.cool_down.min(TRIAL_WAIT_CEILING),
                    }
                } else {
                    inner.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                }
            }
        }
    }

    /// Feed the outcome of an admitted call back in.
    ///
    /// Permanent failures mean the destination answered; they do not count
    /// against its health.
    pub fn record(&self, outcome: &DeliveryOutcome, trial: bool) {
        match outcome {
            DeliveryOutcome::Delivered => self.record_success(trial),
            DeliveryOutcome::RetryableFailure { .. } => self.record_failure(trial),
            DeliveryOutcome::PermanentFailure { .. } => self.record_neutral(trial),
        }
    }

    pub fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial && inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
            inner.window.clear();
            inner.opened_at = None;
            self.transition(&mut inner, CircuitState::Closed);
            return;
        }
        if inner.state == CircuitState::Closed {
            self.push(&mut inner, false);
        }
    }

    pub fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                self.push(&mut inner, true);
                if inner.window.len() >= self.min_calls
                    && inner.failure_rate() >= self.failure_rate_threshold
                {
                    warn!(
                        sink = %self.sink,
                        failure_rate = inner.failure_rate(),
                        cool_down_ms = self.cool_down.as_millis() as u64,
                        "Circuit opened"
                    );
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            // Stragglers admitted before the breaker opened
            _ => {}
        }
    }

    fn record_neutral(&self, trial: bool) {
        if trial {
            self.record_success(trial);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let reopens_in_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                (opened_at + self.cool_down)
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        BreakerSnapshot {
            sink: self.sink,
            state: inner.state,
            failure_rate: inner.failure_rate(),
            window_len: inner.window.len(),
            reopens_in_ms,
        }
    }

    fn push(&self, inner: &mut BreakerInner, failed: bool) {
        if inner.window.len() == self.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        if inner.state != next {
            info!(sink = %self.sink, from = %inner.state, to = %next, "Circuit state change");
            inner.state = next;
            observability::record_circuit_state(self.sink, next.level());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cool_down_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window_size: 20,
            min_calls: 5,
            failure_rate_threshold: 0.5,
            cool_down_ms,
        }
    }

    fn fail_n(breaker: &CircuitBreaker, n: usize) {
        for _ in 0..n {
            assert_eq!(breaker.try_acquire(), Admission::Allowed { trial: false });
            breaker.record(&DeliveryOutcome::transient("timeout"), false);
        }
    }

    #[test]
    fn stays_closed_below_min_calls() {
        let breaker = CircuitBreaker::new(SinkKind::External, &config(1_000));
        fail_n(&breaker, 4);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_five_failures_and_fails_fast() {
        let breaker = CircuitBreaker::new(SinkKind::External, &config(30_000));
        fail_n(&breaker, 5);
        assert_eq!(breaker.state(), CircuitState::Open);

        match breaker.try_acquire() {
            Admission::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(30_000))
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert!(matches!(breaker.try_acquire(), Admission::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn admits_exactly_one_trial_then_closes() {
        let breaker = CircuitBreaker::new(SinkKind::Warehouse, &config(1_000));
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        assert_eq!(breaker.try_acquire(), Admission::Allowed { trial: true });
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(breaker.try_acquire(), Admission::Rejected { .. }));
        assert!(matches!(breaker.try_acquire(), Admission::Rejected { .. }));

        breaker.record(&DeliveryOutcome::Delivered, true);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().window_len, 0);
        assert_eq!(breaker.try_acquire(), Admission::Allowed { trial: false });
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_for_a_full_cool_down() {
        let breaker = CircuitBreaker::new(SinkKind::External, &config(1_000));
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        assert_eq!(breaker.try_acquire(), Admission::Allowed { trial: true });
        breaker.record(&DeliveryOutcome::capacity("429"), true);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().reopens_in_ms, Some(1_000));
    }

    #[test]
    fn permanent_failures_do_not_trip() {
        let breaker = CircuitBreaker::new(SinkKind::External, &config(1_000));
        for _ in 0..10 {
            assert_eq!(breaker.try_acquire(), Admission::Allowed { trial: false });
            breaker.record(&DeliveryOutcome::permanent("400 bad request"), false);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_rate, 0.0);
    }

    #[test]
    fn mixed_window_uses_ratio() {
        let breaker = CircuitBreaker::new(SinkKind::Cache, &config(1_000));
        for i in 0..10 {
            breaker.try_acquire();
            if i % 3 == 0 {
                breaker.record(&DeliveryOutcome::transient("reset"), false);
            } else {
                breaker.record(&DeliveryOutcome::Delivered, false);
            }
        }
        // 4 of 10 failed
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!((breaker.snapshot().failure_rate - 0.4).abs() < 1e-9);
    }
}
