//! Pipeline metric helpers
//!
//! Thin wrappers over the `metrics` facade so names and labels stay
//! consistent across crates, plus an in-process aggregator for the end-of-run
//! summary.

use std::collections::BTreeMap;

use contracts::SinkKind;
use metrics::{counter, gauge, histogram};

/// Record one event pulled from the source
pub fn record_event_received(namespace: &str) {
    counter!(
        "engagement_fanout_events_received_total",
        "namespace" => namespace.to_string()
    )
    .increment(1);
}

/// Record a data-quality condition (forwarded, not an error)
pub fn record_data_quality_warning(kind: &'static str) {
    counter!("engagement_fanout_data_quality_warnings_total", "kind" => kind).increment(1);
}

/// Record an event enriched without reference metadata
pub fn record_enrichment_miss() {
    counter!("engagement_fanout_enrichment_misses_total").increment(1);
}

/// Record a reference-data refresh
pub fn record_reference_refresh(success: bool, entries: usize) {
    let status = if success { "success" } else { "failure" };
    counter!("engagement_fanout_reference_refresh_total", "status" => status).increment(1);
    if success {
        gauge!("engagement_fanout_reference_entries").set(entries as f64);
    }
}

/// Record one delivery attempt and its outcome
/// (`delivered`, `retryable`, `permanent`, `rejected`)
pub fn record_delivery_attempt(sink: SinkKind, outcome: &'static str) {
    counter!(
        "engagement_fanout_delivery_attempts_total",
        "sink" => sink.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record time from first attempt to terminal state
pub fn record_delivery_latency_ms(sink: SinkKind, latency_ms: f64) {
    histogram!(
        "engagement_fanout_delivery_latency_ms",
        "sink" => sink.as_str()
    )
    .record(latency_ms);
}

pub fn record_dead_letter(sink: SinkKind) {
    counter!(
        "engagement_fanout_dead_letters_total",
        "sink" => sink.as_str()
    )
    .increment(1);
}

/// Circuit state as a gauge: 0 = closed, 1 = half-open, 2 = open
pub fn record_circuit_state(sink: SinkKind, state: u8) {
    gauge!(
        "engagement_fanout_circuit_state",
        "sink" => sink.as_str()
    )
    .set(state as f64);
}

pub fn record_checkpoint(namespace: &str, offset: u64) {
    gauge!(
        "engagement_fanout_checkpoint_offset",
        "namespace" => namespace.to_string()
    )
    .set(offset as f64);
}

pub fn record_events_in_flight(count: usize) {
    gauge!("engagement_fanout_events_in_flight").set(count as f64);
}

/// Aggregates terminal delivery outcomes in memory for the run summary.
#[derive(Debug, Clone, Default)]
pub struct PipelineStatsAggregator {
    sinks: BTreeMap<SinkKind, SinkAccumulator>,
}

#[derive(Debug, Clone, Default)]
struct SinkAccumulator {
    delivered: u64,
    dead_lettered: u64,
    attempts: u64,
    latency_ms: RunningStats,
}

impl PipelineStatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal (event, sink) outcome
    pub fn record_terminal(&mut self, sink: SinkKind, delivered: bool, attempts: u32, latency_ms: f64) {
        let acc = self.sinks.entry(sink).or_default();
        if delivered {
            acc.delivered += 1;
        } else {
            acc.dead_lettered += 1;
        }
        acc.attempts += attempts as u64;
        acc.latency_ms.push(latency_ms);
    }

    pub fn summary(&self) -> DeliverySummary {
        DeliverySummary {
            sinks: self
                .sinks
                .iter()
                .map(|(sink, acc)| {
                    let terminal = acc.delivered + acc.dead_lettered;
                    (
                        *sink,
                        SinkSummary {
                            delivered: acc.delivered,
                            dead_lettered: acc.dead_lettered,
                            mean_attempts: if terminal > 0 {
                                acc.attempts as f64 / terminal as f64
                            } else {
                                0.0
                            },
                            latency_ms: StatsSummary::from(&acc.latency_ms),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliverySummary {
    pub sinks: BTreeMap<SinkKind, SinkSummary>,
}

impl DeliverySummary {
    pub fn delivered(&self, sink: SinkKind) -> u64 {
        self.sinks.get(&sink).map_or(0, |s| s.delivered)
    }

    pub fn dead_lettered(&self, sink: SinkKind) -> u64 {
        self.sinks.get(&sink).map_or(0, |s| s.dead_lettered)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkSummary {
    pub delivered: u64,
    pub dead_lettered: u64,
    pub mean_attempts: f64,
    pub latency_ms: StatsSummary,
}

impl std::fmt::Display for DeliverySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Delivery Summary ===")?;
        if self.sinks.is_empty() {
            return writeln!(f, "no terminal deliveries");
        }
        for (sink, summary) in &self.sinks {
            writeln!(
                f,
                "{sink}: delivered={} dead_lettered={} mean_attempts={:.2}",
                summary.delivered, summary.dead_lettered, summary.mean_attempts
            )?;
            writeln!(f, "  latency (ms): {}", summary.latency_ms)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// Online mean/variance (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (value - self.mean);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}
