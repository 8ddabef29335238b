//! Aggregation store - sliding-window content ranking owned by the cache sink
//!
//! Counts live in fixed-width buckets keyed by event time. A bucket expires as
//! a whole once it falls out of the window, taking its seen event ids along,
//! so updates stay O(1) and nothing needs a per-event TTL.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use contracts::{CacheSinkConfig, EnrichedEvent, EventId, EventType};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Ranking weight of one interaction
pub fn event_weight(event_type: EventType) -> f64 {
    match event_type {
        EventType::Play => 1.0,
        EventType::Pause => 0.5,
        EventType::Finish => 3.0,
        EventType::Click => 0.3,
    }
}

/// Weight scaled by how much of the content was consumed
pub fn engagement_score(event_type: EventType, engagement_pct: Option<f64>) -> f64 {
    let weight = event_weight(event_type);
    match engagement_pct {
        Some(pct) => weight * (1.0 + (pct / 100.0).min(1.0)),
        None => weight,
    }
}

/// Windowed aggregate for one content item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentStats {
    pub content_id: Uuid,
    pub content_title: Option<String>,
    pub events: u64,
    pub unique_users: usize,
    pub total_engagement_seconds: f64,
    pub avg_engagement_pct: Option<f64>,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
struct Tally {
    title: Option<String>,
    events: u64,
    users: HashSet<Uuid>,
    engagement_seconds: f64,
    pct_sum: f64,
    pct_count: u64,
    score: f64,
}

impl Tally {
    fn add(&mut self, event: &EnrichedEvent) {
        if event.content_title.is_some() {
            self.title.clone_from(&event.content_title);
        }
        self.events += 1;
        self.users.insert(event.user_id);
        self.engagement_seconds += event.engagement_seconds.unwrap_or(0.0);
        if let Some(pct) = event.engagement_pct {
            self.pct_sum += pct;
            self.pct_count += 1;
        }
        self.score += engagement_score(event.event_type, event.engagement_pct);
    }

    fn merge(&mut self, other: &Tally) {
        if other.title.is_some() {
            self.title.clone_from(&other.title);
        }
        self.events += other.events;
        self.users.extend(other.users.iter().copied());
        self.engagement_seconds += other.engagement_seconds;
        self.pct_sum += other.pct_sum;
        self.pct_count += other.pct_count;
        self.score += other.score;
    }

    fn into_stats(self, content_id: Uuid) -> ContentStats {
        ContentStats {
            content_id,
            content_title: self.title,
            events: self.events,
            unique_users: self.users.len(),
            total_engagement_seconds: self.engagement_seconds,
            avg_engagement_pct: (self.pct_count > 0).then(|| self.pct_sum / self.pct_count as f64),
            score: self.score,
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    seen: HashSet<EventId>,
    content: HashMap<Uuid, Tally>,
}

#[derive(Debug)]
pub struct AggregationStore {
    window_secs: i64,
    bucket_secs: i64,
    /// Bucket start (unix seconds) -> bucket
    buckets: RwLock<BTreeMap<i64, Bucket>>,
}

impl AggregationStore {
    pub fn new(window: Duration, bucket: Duration) -> Self {
        let bucket_secs = (bucket.as_secs() as i64).max(1);
        Self {
            window_secs: (window.as_secs() as i64).max(bucket_secs),
            bucket_secs,
            buckets: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &CacheSinkConfig) -> Self {
        Self::new(
            Duration::from_secs(config.window_minutes * 60),
            Duration::from_secs(config.bucket_secs),
        )
    }

    /// Count an event once. Returns `false` for duplicates and for events
    /// already outside the window.
    pub fn record(&self, event: &EnrichedEvent) -> bool {
        self.record_at(event, Utc::now())
    }

    pub fn record_at(&self, event: &EnrichedEvent, now: DateTime<Utc>) -> bool {
        let ts = event.event_ts.timestamp();
        if ts < self.cutoff(now) {
            debug!(event_id = event.id, "Event older than aggregation window, not ranked");
            return false;
        }

        let start = ts.div_euclid(self.bucket_secs) * self.bucket_secs;
        let mut buckets = self.write();
        let bucket = buckets.entry(start).or_default();
        if !bucket.seen.insert(event.id) {
            return false;
        }
        bucket.content.entry(event.content_id).or_default().add(event);
        true
    }

    /// Highest scoring content in the window: score desc, then event count
    /// desc, then content id.
    pub fn top_n(&self, limit: usize) -> Vec<ContentStats> {
        self.top_n_at(limit, Utc::now())
    }

    pub fn top_n_at(&self, limit: usize, now: DateTime<Utc>) -> Vec<ContentStats> {
        self.evict_expired(now);
        let mut ranked: Vec<ContentStats> = self
            .merged(now, None)
            .into_iter()
            .map(|(content_id, tally)| tally.into_stats(content_id))
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.events.cmp(&a.events))
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        ranked.truncate(limit);
        ranked
    }

    pub fn stats_for(&self, content_id: Uuid) -> Option<ContentStats> {
        self.stats_for_at(content_id, Utc::now())
    }

    pub fn stats_for_at(&self, content_id: Uuid, now: DateTime<Utc>) -> Option<ContentStats> {
        self.evict_expired(now);
        self.merged(now, Some(content_id))
            .remove(&content_id)
            .map(|tally| tally.into_stats(content_id))
    }

    /// Drop buckets that ended before the window start. Returns how many.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        let expired_before = cutoff - self.bucket_secs;
        {
            let buckets = self.read();
            match buckets.first_key_value() {
                Some((start, _)) if *start <= expired_before => {}
                _ => return 0,
            }
        }
        let mut buckets = self.write();
        let kept = buckets.split_off(&(expired_before + 1));
        let dropped = buckets.len();
        *buckets = kept;
        debug!(dropped, "Aggregation buckets expired");
        dropped
    }

    /// Number of live buckets
    pub fn bucket_count(&self) -> usize {
        self.read().len()
    }

    /// Evict on a timer until `shutdown` flips to `true`.
    pub fn spawn_eviction_loop(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        info!(interval_secs = interval.as_secs(), "Aggregation eviction loop started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        store.evict_expired(Utc::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Aggregation eviction loop stopped");
        })
    }

    fn cutoff(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() - self.window_secs
    }

    fn merged(&self, now: DateTime<Utc>, only: Option<Uuid>) -> HashMap<Uuid, Tally> {
        let cutoff = self.cutoff(now);
        let buckets = self.read();
        let mut merged: HashMap<Uuid, Tally> = HashMap::new();
        for (start, bucket) in buckets.iter() {
            if start + self.bucket_secs <= cutoff {
                continue;
            }
            for (content_id, tally) in &bucket.content {
                if only.is_some_and(|wanted| wanted != *content_id) {
                    continue;
                }
                merged.entry(*content_id).or_default().merge(tally);
            }
        }
        merged
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<i64, Bucket>> {
        self.buckets.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<i64, Bucket>> {
        self.buckets.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::tests::sample_event;
    use chrono::TimeZone;

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, second).unwrap()
    }

    fn event(id: EventId, content: u128, user: u128, event_type: EventType, ts: DateTime<Utc>) -> EnrichedEvent {
        let mut event = sample_event(id);
        event.content_id = Uuid::from_u128(content);
        event.user_id = Uuid::from_u128(user);
        event.event_type = event_type;
        event.event_ts = ts;
        event.engagement_pct = None;
        event.engagement_seconds = None;
        event
    }

    fn store() -> AggregationStore {
        AggregationStore::new(Duration::from_secs(600), Duration::from_secs(60))
    }

    #[test]
    fn score_follows_weights_and_engagement() {
        assert_eq!(engagement_score(EventType::Finish, None), 3.0);
        assert_eq!(engagement_score(EventType::Play, Some(50.0)), 1.5);
        assert_eq!(engagement_score(EventType::Pause, Some(250.0)), 1.0);
        assert!((engagement_score(EventType::Click, Some(0.0)) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn record_is_idempotent_per_event_id() {
        let store = store();
        let now = at(30, 0);
        let e = event(1, 1, 1, EventType::Finish, at(29, 0));
        assert!(store.record_at(&e, now));
        assert!(!store.record_at(&e, now));

        let stats = store.stats_for_at(e.content_id, now).unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.score, 3.0);
    }

    #[test]
    fn ranking_orders_by_score_then_count_then_id() {
        let store = store();
        let now = at(30, 0);
        // content 1: one finish = 3.0
        store.record_at(&event(1, 1, 1, EventType::Finish, at(25, 0)), now);
        // content 2: three plays = 3.0 with more events
        for id in 2..5 {
            store.record_at(&event(id, 2, id as u128, EventType::Play, at(26, 0)), now);
        }
        // content 3: one click
        store.record_at(&event(9, 3, 1, EventType::Click, at(27, 0)), now);

        let top = store.top_n_at(2, now);
        let ids: Vec<u128> = top.iter().map(|s| s.content_id.as_u128()).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(top[0].unique_users, 3);
    }

    #[test]
    fn unique_users_merge_across_buckets() {
        let store = store();
        let now = at(30, 0);
        store.record_at(&event(1, 1, 7, EventType::Play, at(21, 0)), now);
        store.record_at(&event(2, 1, 7, EventType::Play, at(28, 30)), now);
        store.record_at(&event(3, 1, 8, EventType::Play, at(29, 59)), now);
        assert_eq!(store.bucket_count(), 3);

        let stats = store.stats_for_at(Uuid::from_u128(1), now).unwrap();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.unique_users, 2);
    }

    #[test]
    fn old_events_are_ignored_and_buckets_expire() {
        let store = store();
        let now = at(30, 0);
        assert!(!store.record_at(&event(1, 1, 1, EventType::Play, at(10, 0)), now));

        assert!(store.record_at(&event(2, 1, 1, EventType::Play, at(21, 0)), now));
        assert!(store.record_at(&event(3, 2, 1, EventType::Play, at(29, 0)), now));

        // Eleven minutes later the 12:21 bucket is gone, 12:29 survives
        let later = at(39, 30);
        assert_eq!(store.evict_expired(later), 1);
        assert!(store.stats_for_at(Uuid::from_u128(1), later).is_none());
        assert_eq!(store.stats_for_at(Uuid::from_u128(2), later).unwrap().events, 1);
    }

    #[test]
    fn averages_only_count_known_percentages() {
        let store = store();
        let now = at(30, 0);
        let mut a = event(1, 1, 1, EventType::Play, at(29, 0));
        a.engagement_pct = Some(40.0);
        a.engagement_seconds = Some(120.0);
        let b = event(2, 1, 2, EventType::Click, at(29, 0));
        store.record_at(&a, now);
        store.record_at(&b, now);

        let stats = store.stats_for_at(Uuid::from_u128(1), now).unwrap();
        assert_eq!(stats.avg_engagement_pct, Some(40.0));
        assert_eq!(stats.total_engagement_seconds, 120.0);
    }
}
