//! PipelineBlueprint - Config Loader output
//!
//! Describes the complete pipeline: where events come from, where reference
//! data comes from, where durable state lives, how dispatch is bounded and
//! how each of the three sinks retries and trips its breaker.
//!
//! Every section has defaults, so an empty document is a valid (if not very
//! useful) pipeline with the external sink disabled.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use validator::Validate;

use crate::{PartitionBy, SinkKind};

/// Config version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Complete pipeline blueprint
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct PipelineBlueprint {
    #[serde(default)]
    pub version: ConfigVersion,

    #[serde(default)]
    #[validate(nested)]
    pub source: SourceConfig,

    #[serde(default)]
    #[validate(nested)]
    pub reference: ReferenceConfig,

    #[serde(default)]
    #[validate(nested)]
    pub state: StateConfig,

    #[serde(default)]
    #[validate(nested)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    #[validate(nested)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    #[validate(nested)]
    pub sinks: SinksConfig,
}

// ===== Source =====

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Durable newline-delimited JSON log
    #[default]
    Jsonl,
    /// In-process log (tests, demos)
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    #[serde(default = "default_source_path")]
    pub path: PathBuf,

    /// How often a caught-up live tail re-checks the log
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 10, max = 60_000))]
    pub poll_interval_ms: u64,

    /// Records pulled per read
    #[serde(default = "default_source_batch_size")]
    #[validate(range(min = 1, max = 100_000))]
    pub batch_size: usize,

    #[serde(default)]
    pub partition_by: PartitionBy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            path: default_source_path(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_source_batch_size(),
            partition_by: PartitionBy::default(),
        }
    }
}

fn default_source_path() -> PathBuf {
    PathBuf::from("./data/events.jsonl")
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_source_batch_size() -> usize {
    100
}

// ===== Reference =====

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// JSON array of `ContentMetadata`
    #[default]
    JsonFile,
    /// Empty in-process catalog, filled programmatically
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReferenceConfig {
    #[serde(default)]
    pub kind: ReferenceKind,

    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Staleness bound is this interval plus one fetch
    #[serde(default = "default_refresh_interval_secs")]
    #[validate(range(min = 1, max = 86_400))]
    pub refresh_interval_secs: u64,

    /// Point-lookup the source when a content id is missing from the snapshot
    #[serde(default = "default_true")]
    pub fetch_on_miss: bool,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            kind: ReferenceKind::default(),
            path: None,
            refresh_interval_secs: default_refresh_interval_secs(),
            fetch_on_miss: true,
        }
    }
}

fn default_refresh_interval_secs() -> u64 {
    60
}

// ===== Durable state =====

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StateConfig {
    /// Holds the ledger, dead letters and checkpoints
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,

    /// fsync journal appends
    #[serde(default)]
    pub fsync: bool,

    /// Journal entries before the ledger is compacted
    #[serde(default = "default_compact_threshold")]
    #[validate(range(min = 100))]
    pub ledger_compact_threshold: usize,

    /// Terminal ledger records younger than this survive compaction
    #[serde(default = "default_retention_hours")]
    #[validate(range(min = 1, max = 8_760))]
    pub retention_hours: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            fsync: false,
            ledger_compact_threshold: default_compact_threshold(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_compact_threshold() -> usize {
    50_000
}

fn default_retention_hours() -> u64 {
    72
}

// ===== Dispatch =====

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatchConfig {
    /// Events between the source and all-sinks-terminal
    #[serde(default = "default_max_in_flight")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_in_flight: usize,

    /// Queue depth of each per-key worker
    #[serde(default = "default_key_queue_capacity")]
    #[validate(range(min = 1, max = 100_000))]
    pub key_queue_capacity: usize,

    /// Minimum spacing of checkpoint writes
    #[serde(default = "default_checkpoint_interval_ms")]
    #[validate(range(max = 600_000))]
    pub checkpoint_interval_ms: u64,

    /// Drain budget on shutdown before in-flight work is abandoned
    #[serde(default = "default_shutdown_grace_secs")]
    #[validate(range(max = 3_600))]
    pub shutdown_grace_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            key_queue_capacity: default_key_queue_capacity(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_max_in_flight() -> usize {
    1_000
}

fn default_key_queue_capacity() -> usize {
    64
}

fn default_checkpoint_interval_ms() -> u64 {
    1_000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

// ===== Backfill =====

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BackfillConfig {
    /// Events in flight at once (no per-key ordering)
    #[serde(default = "default_backfill_concurrency")]
    #[validate(range(min = 1, max = 65_536))]
    pub concurrency: usize,

    #[serde(default = "default_backfill_batch_size")]
    #[validate(range(min = 1, max = 100_000))]
    pub batch_size: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            concurrency: default_backfill_concurrency(),
            batch_size: default_backfill_batch_size(),
        }
    }
}

fn default_backfill_concurrency() -> usize {
    64
}

fn default_backfill_batch_size() -> usize {
    1_000
}

// ===== Sinks =====

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct SinksConfig {
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheSinkConfig,

    #[serde(default)]
    #[validate(nested)]
    pub warehouse: WarehouseSinkConfig,

    #[serde(default)]
    #[validate(nested)]
    pub external: ExternalSinkConfig,
}

impl SinksConfig {
    /// Delivery settings shared by all sinks, viewed uniformly
    pub fn delivery(&self, kind: SinkKind) -> SinkDeliveryConfig {
        match kind {
            SinkKind::Cache => SinkDeliveryConfig {
                kind,
                enabled: self.cache.enabled,
                concurrency: self.cache.concurrency,
                queue_capacity: self.cache.queue_capacity,
                retry: self.cache.retry.clone(),
                circuit_breaker: self.cache.circuit_breaker.clone(),
            },
            SinkKind::Warehouse => SinkDeliveryConfig {
                kind,
                enabled: self.warehouse.enabled,
                concurrency: self.warehouse.concurrency,
                queue_capacity: self.warehouse.queue_capacity,
                retry: self.warehouse.retry.clone(),
                circuit_breaker: self.warehouse.circuit_breaker.clone(),
            },
            SinkKind::External => SinkDeliveryConfig {
                kind,
                enabled: self.external.enabled,
                concurrency: self.external.concurrency,
                queue_capacity: self.external.queue_capacity,
                retry: self.external.retry.clone(),
                circuit_breaker: self.external.circuit_breaker.clone(),
            },
        }
    }

    pub fn enabled(&self) -> Vec<SinkKind> {
        SinkKind::ALL
            .into_iter()
            .filter(|kind| self.delivery(*kind).enabled)
            .collect()
    }
}

/// Uniform view of one sink's delivery machinery settings
#[derive(Debug, Clone)]
pub struct SinkDeliveryConfig {
    pub kind: SinkKind,
    pub enabled: bool,
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Per-event retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    /// Attempts before an event is dead-lettered
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    #[validate(range(min = 1, max = 600_000))]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    #[validate(range(min = 1, max = 3_600_000))]
    pub max_delay_ms: u64,

    /// Relative jitter applied to each delay (0.25 = ±25%)
    #[serde(default = "default_jitter")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            jitter: default_jitter(),
        }
    }

    pub fn cache_default() -> Self {
        Self::new(3, 50, 1_000)
    }

    pub fn warehouse_default() -> Self {
        Self::new(5, 200, 10_000)
    }

    pub fn external_default() -> Self {
        Self::new(8, 500, 60_000)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::warehouse_default()
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.25
}

/// Per-sink rolling health guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CircuitBreakerConfig {
    /// Outcomes kept in the rolling window
    #[serde(default = "default_window_size")]
    #[validate(range(min = 1, max = 10_000))]
    pub window_size: usize,

    /// Outcomes required before the ratio is evaluated
    #[serde(default = "default_min_calls")]
    #[validate(range(min = 1, max = 10_000))]
    pub min_calls: usize,

    #[serde(default = "default_failure_rate_threshold")]
    #[validate(range(min = 0.01, max = 1.0))]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_cool_down_ms")]
    #[validate(range(min = 1, max = 3_600_000))]
    pub cool_down_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            min_calls: default_min_calls(),
            failure_rate_threshold: default_failure_rate_threshold(),
            cool_down_ms: default_cool_down_ms(),
        }
    }
}

fn default_window_size() -> usize {
    20
}

fn default_min_calls() -> usize {
    5
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_cool_down_ms() -> u64 {
    30_000
}

/// Low-latency key-value + aggregation sink
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheSinkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_concurrency")]
    #[validate(range(min = 1, max = 4_096))]
    pub concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub queue_capacity: usize,

    #[serde(default = "RetryConfig::cache_default")]
    #[validate(nested)]
    pub retry: RetryConfig,

    #[serde(default)]
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// TTL of per-event keys
    #[serde(default = "default_event_ttl_secs")]
    #[validate(range(min = 1))]
    pub event_ttl_secs: u64,

    /// Sliding ranking window
    #[serde(default = "default_window_minutes")]
    #[validate(range(min = 1, max = 1_440))]
    pub window_minutes: u64,

    /// Width of one aggregation bucket
    #[serde(default = "default_bucket_secs")]
    #[validate(range(min = 1, max = 3_600))]
    pub bucket_secs: u64,

    /// Proactive eviction timer
    #[serde(default = "default_eviction_interval_secs")]
    #[validate(range(min = 1, max = 3_600))]
    pub eviction_interval_secs: u64,

    /// Length cap of each content's recent-events list
    #[serde(default = "default_recent_events_limit")]
    #[validate(range(min = 1, max = 100_000))]
    pub recent_events_limit: usize,

    /// Idle expiry of a recent-events list
    #[serde(default = "default_recent_events_ttl_secs")]
    #[validate(range(min = 1))]
    pub recent_events_ttl_secs: u64,
}

impl Default for CacheSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_cache_concurrency(),
            queue_capacity: default_queue_capacity(),
            retry: RetryConfig::cache_default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            event_ttl_secs: default_event_ttl_secs(),
            window_minutes: default_window_minutes(),
            bucket_secs: default_bucket_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            recent_events_limit: default_recent_events_limit(),
            recent_events_ttl_secs: default_recent_events_ttl_secs(),
        }
    }
}

fn default_cache_concurrency() -> usize {
    32
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_event_ttl_secs() -> u64 {
    86_400
}

fn default_window_minutes() -> u64 {
    10
}

fn default_bucket_secs() -> u64 {
    60
}

fn default_eviction_interval_secs() -> u64 {
    30
}

fn default_recent_events_limit() -> usize {
    1_000
}

fn default_recent_events_ttl_secs() -> u64 {
    3_600
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseTableKind {
    /// Date-partitioned JSONL files under `dir`
    #[default]
    Jsonl,
    Memory,
}

/// Batched analytical warehouse sink
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WarehouseSinkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_warehouse_concurrency")]
    #[validate(range(min = 1, max = 4_096))]
    pub concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub queue_capacity: usize,

    #[serde(default = "RetryConfig::warehouse_default")]
    #[validate(nested)]
    pub retry: RetryConfig,

    #[serde(default)]
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub table: WarehouseTableKind,

    #[serde(default = "default_warehouse_dir")]
    pub dir: PathBuf,

    /// Rows per insert
    #[serde(default = "default_warehouse_batch_size")]
    #[validate(range(min = 1, max = 100_000))]
    pub batch_size: usize,

    /// Longest a partially filled batch waits before it is flushed
    #[serde(default = "default_max_batch_ms")]
    #[validate(range(min = 1, max = 600_000))]
    pub max_batch_ms: u64,
}

impl Default for WarehouseSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_warehouse_concurrency(),
            queue_capacity: default_queue_capacity(),
            retry: RetryConfig::warehouse_default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            table: WarehouseTableKind::default(),
            dir: default_warehouse_dir(),
            batch_size: default_warehouse_batch_size(),
            max_batch_ms: default_max_batch_ms(),
        }
    }
}

fn default_warehouse_concurrency() -> usize {
    // Batches are formed from concurrent deliveries, so this also caps batch fill
    512
}

fn default_warehouse_dir() -> PathBuf {
    PathBuf::from("./warehouse")
}

fn default_warehouse_batch_size() -> usize {
    500
}

fn default_max_batch_ms() -> u64 {
    200
}

/// Best-effort external HTTP integration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExternalSinkConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_external_concurrency")]
    #[validate(range(min = 1, max = 4_096))]
    pub concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub queue_capacity: usize,

    #[serde(default = "RetryConfig::external_default")]
    #[validate(nested)]
    pub retry: RetryConfig,

    #[serde(default)]
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Endpoint receiving the JSON payload; required when enabled
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_external_timeout_ms")]
    #[validate(range(min = 1, max = 600_000))]
    pub timeout_ms: u64,

    /// Static headers sent with every request (e.g. authorization)
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for ExternalSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: default_external_concurrency(),
            queue_capacity: default_queue_capacity(),
            retry: RetryConfig::external_default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            url: None,
            timeout_ms: default_external_timeout_ms(),
            headers: HashMap::new(),
        }
    }
}

fn default_external_concurrency() -> usize {
    16
}

fn default_external_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}
