//! SinkHandle - one sink adapter with its queue, concurrency budget, retry
//! policy and circuit breaker
//!
//! Each submitted job runs as its own task. A job holds a concurrency permit
//! only while the writer is doing I/O; backoff sleeps and breaker waits
//! release it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use contracts::{
    ContractError, DeliveryOutcome, DeliveryRecord, DeliveryState, EnrichedEvent, EventId,
    SinkDeliveryConfig, SinkKind, SinkWriter,
};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::breaker::{Admission, BreakerSnapshot, CircuitBreaker};
use crate::dead_letter::{DeadLetter, DeadLetterStore};
use crate::error::DispatcherError;
use crate::ledger::DeliveryLedger;
use crate::metrics::{MetricsSnapshot, SinkMetrics};
use crate::retry::RetryPolicy;

/// Terminal result of one `(event, sink)` job
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub event_id: EventId,
    pub sink: SinkKind,
    pub state: DeliveryState,
    /// Total attempts including those made before a restart
    pub attempts: u32,
    pub latency: Duration,
    pub last_error: Option<String>,
}

impl JobReport {
    pub fn delivered(&self) -> bool {
        self.state == DeliveryState::Delivered
    }
}

/// `Err` only for ledger or dead-letter storage failures
pub type JobResult = Result<JobReport, ContractError>;

struct DeliveryJob {
    event: Arc<EnrichedEvent>,
    prior: DeliveryRecord,
    reply: oneshot::Sender<JobResult>,
}

/// Everything a job task needs, shared across the sink's jobs
struct JobContext {
    kind: SinkKind,
    name: String,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    budget: Semaphore,
    metrics: Arc<SinkMetrics>,
    ledger: Arc<DeliveryLedger>,
    dead_letters: Arc<DeadLetterStore>,
}

/// Read-only view of a running sink for the operator surface
#[derive(Clone)]
pub struct SinkMonitor {
    kind: SinkKind,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<SinkMetrics>,
}

impl SinkMonitor {
    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    pub fn breaker(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Handle to a running sink worker
pub struct SinkHandle {
    kind: SinkKind,
    name: String,
    /// `None` once shutdown began
    tx: Option<mpsc::Sender<DeliveryJob>>,
    metrics: Arc<SinkMetrics>,
    breaker: Arc<CircuitBreaker>,
    worker_handle: JoinHandle<()>,
}

impl SinkHandle {
    /// Spawn the worker for `writer` using the sink's delivery settings
    pub fn spawn<W>(
        writer: W,
        settings: &SinkDeliveryConfig,
        ledger: Arc<DeliveryLedger>,
        dead_letters: Arc<DeadLetterStore>,
    ) -> Self
    where
        W: SinkWriter + Sync + 'static,
    {
        let kind = writer.kind();
        let name = writer.name().to_string();
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let metrics = Arc::new(SinkMetrics::new());
        let breaker = Arc::new(CircuitBreaker::new(kind, &settings.circuit_breaker));

        let context = Arc::new(JobContext {
            kind,
            name: name.clone(),
            policy: RetryPolicy::from_config(&settings.retry),
            breaker: Arc::clone(&breaker),
            budget: Semaphore::new(settings.concurrency.max(1)),
            metrics: Arc::clone(&metrics),
            ledger,
            dead_letters,
        });

        let worker_handle = tokio::spawn(async move {
            sink_worker(Arc::new(writer), rx, context).await;
        });

        Self {
            kind,
            name,
            tx: Some(tx),
            metrics,
            breaker,
            worker_handle,
        }
    }

    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    /// Get sink name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current metrics
    pub fn metrics(&self) -> &Arc<SinkMetrics> {
        &self.metrics
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn monitor(&self) -> SinkMonitor {
        SinkMonitor {
            kind: self.kind,
            breaker: Arc::clone(&self.breaker),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Queue an event for delivery, resuming from `prior` (attempt count and
    /// next retry instant). Waits while the queue is full.
    pub async fn submit(
        &self,
        event: Arc<EnrichedEvent>,
        prior: DeliveryRecord,
    ) -> Result<oneshot::Receiver<JobResult>, DispatcherError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(DispatcherError::SinkClosed { sink: self.kind })?;
        let (reply, rx) = oneshot::channel();
        tx.send(DeliveryJob {
            event,
            prior,
            reply,
        })
        .await
        .map_err(|_| DispatcherError::SinkClosed { sink: self.kind })?;
        self.metrics.set_queue_len(tx.max_capacity() - tx.capacity());
        Ok(rx)
    }

    /// Stop accepting jobs, let running jobs reach a terminal state, then
    /// flush and close the writer.
    #[instrument(name = "sink_handle_shutdown", skip(self), fields(sink = %self.kind))]
    pub async fn shutdown(mut self) {
        // Drop sender to signal worker to stop
        self.tx.take();
        if let Err(e) = (&mut self.worker_handle).await {
            error!(sink = %self.name, error = ?e, "Worker task panicked");
        }
        debug!(sink = %self.name, "SinkHandle shutdown complete");
    }

    /// Like [`shutdown`](Self::shutdown) but gives up after `grace`,
    /// abandoning unfinished jobs. Their ledger records stay pending so a
    /// restart resumes them. Returns `false` when jobs were abandoned.
    #[instrument(name = "sink_handle_shutdown_within", skip(self), fields(sink = %self.kind))]
    pub async fn shutdown_within(mut self, grace: Duration) -> bool {
        self.tx.take();
        match tokio::time::timeout(grace, &mut self.worker_handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(sink = %self.name, error = ?e, "Worker task panicked");
                true
            }
            Err(_) => {
                warn!(
                    sink = %self.name,
                    in_flight = self.metrics.in_flight(),
                    "Shutdown grace expired, abandoning in-flight deliveries"
                );
                self.worker_handle.abort();
                false
            }
        }
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        // Dropping the worker drops its job set, which aborts every job
        self.worker_handle.abort();
    }
}

/// Worker task that accepts jobs and runs each one to a terminal state
#[instrument(
    name = "sink_worker_loop",
    skip(writer, rx, context),
    fields(sink = %context.name)
)]
async fn sink_worker<W>(writer: Arc<W>, mut rx: mpsc::Receiver<DeliveryJob>, context: Arc<JobContext>)
where
    W: SinkWriter + Sync + 'static,
{
    debug!("Sink worker started");
    let mut jobs = JoinSet::new();

    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(job) => {
                    context.metrics.set_queue_len(rx.len());
                    jobs.spawn(run_job(Arc::clone(&writer), Arc::clone(&context), job));
                }
                None => break,
            },
            Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Delivery task failed");
                }
            }
        }
    }

    while let Some(joined) = jobs.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Delivery task failed");
        }
    }

    if let Err(e) = writer.flush().await {
        error!(error = %e, "Flush failed on shutdown");
    }
    if let Err(e) = writer.close().await {
        error!(error = %e, "Close failed on shutdown");
    }
    debug!("Sink worker stopped");
}

#[instrument(
    name = "sink_delivery",
    skip_all,
    fields(sink = %context.kind, event_id = job.event.id)
)]
async fn run_job<W>(writer: Arc<W>, context: Arc<JobContext>, job: DeliveryJob)
where
    W: SinkWriter + Sync,
{
    let DeliveryJob {
        event,
        prior,
        reply,
    } = job;

    context.metrics.job_started();
    let started = Instant::now();
    let result = deliver_until_terminal(writer.as_ref(), &context, &event, prior).await;
    context.metrics.job_finished();

    let result = result.map(|(state, attempts, last_error)| {
        let latency = started.elapsed();
        observability::record_delivery_latency_ms(context.kind, latency.as_secs_f64() * 1000.0);
        JobReport {
            event_id: event.id,
            sink: context.kind,
            state,
            attempts,
            latency,
            last_error,
        }
    });

    if reply.send(result).is_err() {
        debug!("Submitter went away before the job finished");
    }
}

/// The per-(event, sink) state machine:
/// pending -> delivered, pending -> pending (retry), pending -> dead-lettered.
async fn deliver_until_terminal<W>(
    writer: &W,
    context: &JobContext,
    event: &EnrichedEvent,
    prior: DeliveryRecord,
) -> Result<(DeliveryState, u32, Option<String>), ContractError>
where
    W: SinkWriter + Sync,
{
    let kind = context.kind;
    let mut attempts = prior.attempt_count;

    if let Some(wait) = prior
        .next_retry_at
        .and_then(|due| (due - Utc::now()).to_std().ok())
    {
        debug!(attempt = attempts, wait_ms = wait.as_millis() as u64, "Resuming scheduled retry");
        tokio::time::sleep(wait).await;
    }

    loop {
        let permit = context
            .budget
            .acquire()
            .await
            .map_err(|_| ContractError::sink_write(&context.name, "concurrency budget closed"))?;

        // A rejection spends an attempt like any retryable failure
        let (error, floor) = match context.breaker.try_acquire() {
            Admission::Rejected { retry_after } => {
                drop(permit);
                attempts += 1;
                context.metrics.inc_rejected();
                observability::record_delivery_attempt(kind, "rejected");
                (format!("circuit open for {}", context.name), retry_after)
            }
            Admission::Allowed { trial } => {
                attempts += 1;
                context.metrics.inc_attempts();
                let outcome = writer.deliver(event).await;
                drop(permit);
                context.breaker.record(&outcome, trial);

                match outcome {
                    DeliveryOutcome::Delivered => {
                        observability::record_delivery_attempt(kind, "delivered");
                        context.ledger.mark_terminal(
                            event.id,
                            kind,
                            DeliveryState::Delivered,
                            attempts,
                            None,
                        )?;
                        context.metrics.inc_delivered();
                        return Ok((DeliveryState::Delivered, attempts, None));
                    }
                    DeliveryOutcome::PermanentFailure { error } => {
                        observability::record_delivery_attempt(kind, "permanent");
                        return dead_letter(context, event, attempts, error);
                    }
                    DeliveryOutcome::RetryableFailure {
                        kind: failure,
                        error,
                    } => {
                        observability::record_delivery_attempt(kind, "retryable");
                        debug!(attempt = attempts, failure = ?failure, error = %error, "Delivery failed");
                        (error, Duration::ZERO)
                    }
                }
            }
        };

        if context.policy.exhausted(attempts) {
            warn!(attempt = attempts, error = %error, "Retry budget exhausted");
            return dead_letter(context, event, attempts, error);
        }

        let delay = context.policy.backoff(attempts).max(floor);
        let next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay));
        context
            .ledger
            .record_attempt(event.id, kind, attempts, Some(error.clone()), next_retry_at)?;
        context.metrics.inc_retries();
        debug!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retry scheduled"
        );
        tokio::time::sleep(delay).await;
    }
}

fn dead_letter(
    context: &JobContext,
    event: &EnrichedEvent,
    attempts: u32,
    error: String,
) -> Result<(DeliveryState, u32, Option<String>), ContractError> {
    if let Some(existing) = context
        .ledger
        .get(event.id, context.kind)
        .filter(DeliveryRecord::is_terminal)
    {
        // Another run finished this pair meanwhile
        return Ok((existing.state, existing.attempt_count, existing.last_error));
    }

    context.dead_letters.append(DeadLetter {
        event_id: event.id,
        sink: context.kind,
        last_error: error.clone(),
        attempts,
        payload: event.clone(),
        dead_lettered_at: Utc::now(),
    })?;
    context.ledger.mark_terminal(
        event.id,
        context.kind,
        DeliveryState::DeadLettered,
        attempts,
        Some(error.clone()),
    )?;
    context.metrics.inc_dead_lettered();
    observability::record_dead_letter(context.kind);
    Ok((DeliveryState::DeadLettered, attempts, Some(error)))
}
