//! CacheSink - key-value projection, per-content recent events and the
//! windowed ranking

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use contracts::{
    CacheSinkConfig, ContractError, DeliveryOutcome, EnrichedEvent, EventId, EventType, SinkKind,
    SinkWriter,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use super::aggregation::AggregationStore;
use super::{outcome_from_error, KeyValueStore};

/// Minimum time between two sweeps of expired entries
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    /// Newest first
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn rendered(&self) -> String {
        match &self.value {
            Value::Text(text) => text.clone(),
            Value::List(items) => serde_json::to_string(items).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<String, Entry>,
    next_purge: Option<Instant>,
}

impl StoreInner {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.live(now));
        self.next_purge = Some(now + PURGE_INTERVAL);
        before - self.entries.len()
    }

    /// Sweep expired entries at most once per `PURGE_INTERVAL`
    fn maybe_purge(&mut self, now: Instant) {
        if self.next_purge.is_none_or(|at| now >= at) {
            let purged = self.purge_expired(now);
            if purged > 0 {
                trace!(purged, "Expired cache entries removed");
            }
        }
    }
}

/// In-process store. Clones share the same map.
///
/// Expired entries are invisible to reads and swept out by writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unexpired keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .read()
            .entries
            .iter()
            .filter(|(_, entry)| entry.live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Unexpired key/value pairs, sorted by key. Lists render as JSON arrays.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let now = Instant::now();
        let mut pairs: Vec<(String, String)> = self
            .read()
            .entries
            .iter()
            .filter(|(_, entry)| entry.live(now))
            .map(|(key, entry)| (key.clone(), entry.rendered()))
            .collect();
        pairs.sort();
        pairs
    }

    /// Up to `count` items of the list at `key`, newest first
    pub fn range(&self, key: &str, count: usize) -> Result<Vec<String>, ContractError> {
        let now = Instant::now();
        match self.read().entries.get(key).filter(|entry| entry.live(now)) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(items.iter().take(count).cloned().collect()),
            Some(_) => Err(wrong_type(key, "a list")),
        }
    }

    /// Drop every expired entry now. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        self.write().purge_expired(Instant::now())
    }

    /// Live keys
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries held in memory, expired ones not yet swept included
    pub fn stored(&self) -> usize {
        self.read().entries.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), ContractError> {
        let now = Instant::now();
        let entry = Entry {
            value: Value::Text(value),
            expires_at: ttl.map(|ttl| now + ttl),
        };
        let mut inner = self.write();
        inner.maybe_purge(now);
        inner.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ContractError> {
        let now = Instant::now();
        match self.read().entries.get(key).filter(|entry| entry.live(now)) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key, "a string")),
        }
    }

    async fn push_capped(
        &self,
        key: &str,
        value: String,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<bool, ContractError> {
        let now = Instant::now();
        let mut inner = self.write();
        inner.maybe_purge(now);

        let entry = inner
            .entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if !entry.live(now) {
                    entry.value = Value::List(VecDeque::new());
                }
            })
            .or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
        let Value::List(items) = &mut entry.value else {
            return Err(wrong_type(key, "a list"));
        };
        entry.expires_at = ttl.map(|ttl| now + ttl);

        if items.contains(&value) {
            return Ok(false);
        }
        items.push_front(value);
        items.truncate(limit.max(1));
        Ok(true)
    }

    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, ContractError> {
        self.range(key, count)
    }
}

fn wrong_type(key: &str, expected: &str) -> ContractError {
    ContractError::sink_write("cache", format!("{key} does not hold {expected}"))
}

pub fn event_key(event: &EnrichedEvent) -> String {
    format!("event:{}", event.id)
}

pub fn content_meta_key(event: &EnrichedEvent) -> String {
    format!("content_meta:{}", event.content_id)
}

pub fn recent_events_key(content_id: Uuid) -> String {
    format!("recent_events:{content_id}")
}

/// Cached view of an event. Leaves out `processed_at` so a redelivery writes
/// byte-identical values.
pub fn event_projection(event: &EnrichedEvent) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(event)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("processed_at");
    }
    serde_json::to_string(&value)
}

/// One entry of a content's recent-events list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentEvent {
    pub event_id: EventId,
    pub user_id: Uuid,
    pub event_type: EventType,
    pub event_ts: DateTime<Utc>,
    pub engagement_seconds: Option<f64>,
    pub engagement_pct: Option<f64>,
    pub device: Option<String>,
}

impl From<&EnrichedEvent> for RecentEvent {
    fn from(event: &EnrichedEvent) -> Self {
        Self {
            event_id: event.id,
            user_id: event.user_id,
            event_type: event.event_type,
            event_ts: event.event_ts,
            engagement_seconds: event.engagement_seconds,
            engagement_pct: event.engagement_pct,
            device: event.device.clone(),
        }
    }
}

/// Newest-first recent events of `content_id`, at most `limit`
pub fn recent_events(
    store: &MemoryKeyValueStore,
    content_id: Uuid,
    limit: usize,
) -> Result<Vec<RecentEvent>, ContractError> {
    store
        .range(&recent_events_key(content_id), limit)?
        .iter()
        .map(|item| {
            serde_json::from_str(item).map_err(|e| {
                ContractError::storage("cache", format!("recent event for {content_id}: {e}"))
            })
        })
        .collect()
}

pub struct CacheSink<K> {
    name: String,
    store: K,
    aggregation: Arc<AggregationStore>,
    event_ttl: Duration,
    recent_limit: usize,
    recent_ttl: Duration,
}

impl<K: KeyValueStore + Sync> CacheSink<K> {
    pub fn new(store: K, aggregation: Arc<AggregationStore>, event_ttl: Duration) -> Self {
        let defaults = CacheSinkConfig::default();
        Self {
            name: "cache".to_string(),
            store,
            aggregation,
            event_ttl,
            recent_limit: defaults.recent_events_limit,
            recent_ttl: Duration::from_secs(defaults.recent_events_ttl_secs),
        }
    }

    pub fn from_config(store: K, aggregation: Arc<AggregationStore>, config: &CacheSinkConfig) -> Self {
        Self::new(store, aggregation, Duration::from_secs(config.event_ttl_secs))
            .with_recent_events(
                config.recent_events_limit,
                Duration::from_secs(config.recent_events_ttl_secs),
            )
    }

    pub fn with_recent_events(mut self, limit: usize, ttl: Duration) -> Self {
        self.recent_limit = limit;
        self.recent_ttl = ttl;
        self
    }

    pub fn aggregation(&self) -> &Arc<AggregationStore> {
        &self.aggregation
    }

    async fn write(&self, event: &EnrichedEvent) -> Result<(), ContractError> {
        let encode = |e: serde_json::Error| {
            ContractError::sink_write(&self.name, format!("encode event: {e}"))
        };
        let projection = event_projection(event).map_err(encode)?;
        self.store
            .set(&event_key(event), projection, Some(self.event_ttl))
            .await?;

        let recent = serde_json::to_string(&RecentEvent::from(event)).map_err(encode)?;
        self.store
            .push_capped(
                &recent_events_key(event.content_id),
                recent,
                self.recent_limit,
                Some(self.recent_ttl),
            )
            .await?;

        if event.has_metadata() {
            let meta = json!({
                "slug": event.content_slug,
                "title": event.content_title,
                "content_type": event.content_type,
                "length_seconds": event.content_length_seconds,
            });
            self.store
                .set(&content_meta_key(event), meta.to_string(), None)
                .await?;
        }
        Ok(())
    }
}

impl<K: KeyValueStore + Sync> SinkWriter for CacheSink<K> {
    fn kind(&self) -> SinkKind {
        SinkKind::Cache
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "cache_sink_deliver",
        skip(self, event),
        fields(sink = %self.name, event_id = event.id)
    )]
    async fn deliver(&self, event: &EnrichedEvent) -> DeliveryOutcome {
        if let Err(e) = self.write(event).await {
            return outcome_from_error(&e);
        }
        if !self.aggregation.record(event) {
            debug!("Event already ranked or outside the window");
        }
        DeliveryOutcome::Delivered
    }

    #[instrument(name = "cache_sink_flush", skip(self))]
    async fn flush(&self) -> Result<(), ContractError> {
        // Nothing buffered
        Ok(())
    }

    #[instrument(name = "cache_sink_close", skip(self))]
    async fn close(&self) -> Result<(), ContractError> {
        debug!(sink = %self.name, "CacheSink closed");
        Ok(())
    }
}
