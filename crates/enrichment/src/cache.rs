//! Reference cache
//!
//! Readers load an `Arc<ReferenceSnapshot>` without locking; the refresher
//! builds a complete replacement and swaps it in, so a reader sees either
//! the old or the new snapshot and never a partial one.
//!
//! Staleness is bounded by the refresh interval plus the duration of one
//! `fetch_all`. A failed refresh keeps the previous snapshot. Entries filled
//! by point lookups while a refresh is running survive its swap.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use contracts::{ContentMetadata, ReferenceSource};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Immutable view of the reference data at one point in time
#[derive(Debug, Clone, Default)]
pub struct ReferenceSnapshot {
    entries: HashMap<Uuid, Arc<ContentMetadata>>,
    /// Ids the source confirmed absent since the last full refresh
    known_missing: HashSet<Uuid>,
    /// Point-fetched ids and the refresh epoch current when they landed
    fetched: HashMap<Uuid, u64>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl ReferenceSnapshot {
    fn from_entries(entries: Vec<ContentMetadata>, loaded_at: DateTime<Utc>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|m| (m.content_id, Arc::new(m)))
                .collect(),
            known_missing: HashSet::new(),
            fetched: HashMap::new(),
            loaded_at: Some(loaded_at),
        }
    }

    /// Carry over entries point-fetched during epoch `since` or later that
    /// the full load does not have
    fn merge_fetched_since(&mut self, current: &ReferenceSnapshot, since: u64) {
        for (content_id, epoch) in &current.fetched {
            if *epoch < since || self.entries.contains_key(content_id) {
                continue;
            }
            if let Some(metadata) = current.entries.get(content_id) {
                self.entries.insert(*content_id, Arc::clone(metadata));
                self.fetched.insert(*content_id, *epoch);
            }
        }
    }

    pub fn get(&self, content_id: &Uuid) -> Option<&Arc<ContentMetadata>> {
        self.entries.get(content_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct ReferenceCache<R> {
    source: R,
    inner: ArcSwap<ReferenceSnapshot>,
    refreshing: AtomicBool,
    /// Bumped when a refresh starts
    epoch: AtomicU64,
    fetch_on_miss: bool,
}

impl<R> ReferenceCache<R>
where
    R: ReferenceSource + Sync,
{
    /// Create a cache with an empty snapshot. Call [`refresh`](Self::refresh)
    /// to load it.
    pub fn new(source: R, fetch_on_miss: bool) -> Self {
        Self {
            source,
            inner: ArcSwap::from_pointee(ReferenceSnapshot::default()),
            refreshing: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            fetch_on_miss,
        }
    }

    /// Current snapshot. Stays consistent even if a refresh swaps in new data.
    pub fn snapshot(&self) -> Arc<ReferenceSnapshot> {
        self.inner.load_full()
    }

    /// Lock-free lookup in the current snapshot
    pub fn get(&self, content_id: Uuid) -> Option<Arc<ContentMetadata>> {
        self.inner.load().get(&content_id).cloned()
    }

    /// Lookup with a point fetch on miss (when enabled).
    ///
    /// A fetched entry is merged into a new snapshot. An id the source reports
    /// as absent is remembered until the next full refresh. Fetch errors are
    /// logged and treated as absent.
    pub async fn get_or_fetch(&self, content_id: Uuid) -> Option<Arc<ContentMetadata>> {
        {
            let snapshot = self.inner.load();
            if let Some(found) = snapshot.get(&content_id) {
                return Some(Arc::clone(found));
            }
            if !self.fetch_on_miss || snapshot.known_missing.contains(&content_id) {
                return None;
            }
        }

        match self.source.fetch_one(content_id).await {
            Ok(Some(metadata)) => {
                let metadata = Arc::new(metadata);
                self.inner.rcu(|current| {
                    let mut next = ReferenceSnapshot::clone(current);
                    next.known_missing.remove(&content_id);
                    next.entries.insert(content_id, Arc::clone(&metadata));
                    next.fetched
                        .insert(content_id, self.epoch.load(Ordering::SeqCst));
                    next
                });
                debug!(%content_id, "Reference miss filled by point lookup");
                Some(metadata)
            }
            Ok(None) => {
                self.inner.rcu(|current| {
                    let mut next = ReferenceSnapshot::clone(current);
                    next.known_missing.insert(content_id);
                    next
                });
                None
            }
            Err(e) => {
                warn!(%content_id, error = %e, "Reference point lookup failed");
                None
            }
        }
    }

    /// Reload the full snapshot. Only one refresh runs at a time; a call that
    /// finds one in progress returns immediately.
    ///
    /// Returns `true` when a new snapshot was swapped in.
    pub async fn refresh(&self) -> bool {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reference refresh already in progress, skipping");
            return false;
        }

        let started = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let swapped = match self.source.fetch_all().await {
            Ok(entries) => {
                let count = entries.len();
                let loaded = ReferenceSnapshot::from_entries(entries, Utc::now());
                self.inner.rcu(|current| {
                    let mut next = loaded.clone();
                    next.merge_fetched_since(current, started);
                    next
                });
                observability::record_reference_refresh(true, count);
                info!(entries = count, "Reference snapshot refreshed");
                true
            }
            Err(e) => {
                observability::record_reference_refresh(false, 0);
                error!(error = %e, "Failed to refresh reference data, keeping stale data");
                false
            }
        };

        self.refreshing.store(false, Ordering::SeqCst);
        swapped
    }

    /// Refresh on a timer until `shutdown` flips to `true`.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        R: 'static,
    {
        let cache = Arc::clone(self);
        info!(interval_secs = interval.as_secs(), "Reference refresh loop started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        cache.refresh().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Reference refresh loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticReferenceSource;
    use contracts::{ContentType, ContractError};
    use std::sync::atomic::AtomicU64;

    fn newsletter(id: u128, title: &str) -> ContentMetadata {
        ContentMetadata {
            content_id: Uuid::from_u128(id),
            slug: format!("issue-{id}"),
            title: title.into(),
            content_type: ContentType::Newsletter,
            length_seconds: None,
        }
    }

    /// Source that can be switched into failure and counts point lookups
    #[derive(Default)]
    struct FlakySource {
        inner: StaticReferenceSource,
        failing: AtomicBool,
        lookups: AtomicU64,
    }

    impl ReferenceSource for FlakySource {
        async fn fetch_all(&self) -> Result<Vec<ContentMetadata>, ContractError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ContractError::reference("connection refused"));
            }
            self.inner.fetch_all().await
        }

        async fn fetch_one(&self, content_id: Uuid) -> Result<Option<ContentMetadata>, ContractError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ContractError::reference("connection refused"));
            }
            self.inner.fetch_one(content_id).await
        }
    }

    #[tokio::test]
    async fn refresh_swaps_snapshot() {
        let source = StaticReferenceSource::new([newsletter(1, "Weekly")]);
        let cache = ReferenceCache::new(source.clone(), false);
        assert!(cache.get(Uuid::from_u128(1)).is_none());

        assert!(cache.refresh().await);
        let before = cache.snapshot();
        assert_eq!(before.len(), 1);

        source.upsert(newsletter(1, "Weekly (renamed)"));
        assert!(cache.refresh().await);

        // An old snapshot held by a reader is unaffected by the swap
        assert_eq!(before.get(&Uuid::from_u128(1)).unwrap().title, "Weekly");
        assert_eq!(
            cache.get(Uuid::from_u128(1)).unwrap().title,
            "Weekly (renamed)"
        );
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_data() {
        let source = FlakySource::default();
        source.inner.upsert(newsletter(1, "Weekly"));
        let cache = ReferenceCache::new(source, false);
        assert!(cache.refresh().await);

        cache.source.failing.store(true, Ordering::SeqCst);
        assert!(!cache.refresh().await);
        assert_eq!(cache.get(Uuid::from_u128(1)).unwrap().title, "Weekly");
    }

    #[tokio::test]
    async fn miss_is_filled_by_point_lookup() {
        let source = FlakySource::default();
        let cache = ReferenceCache::new(source, true);
        cache.refresh().await;

        cache.source.inner.upsert(newsletter(7, "Late arrival"));
        let found = cache.get_or_fetch(Uuid::from_u128(7)).await.unwrap();
        assert_eq!(found.title, "Late arrival");
        // Now served from the snapshot
        assert!(cache.get(Uuid::from_u128(7)).is_some());
        assert_eq!(cache.source.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn confirmed_absence_is_remembered_until_refresh() {
        let source = FlakySource::default();
        let cache = ReferenceCache::new(source, true);

        assert!(cache.get_or_fetch(Uuid::from_u128(9)).await.is_none());
        assert!(cache.get_or_fetch(Uuid::from_u128(9)).await.is_none());
        assert_eq!(cache.source.lookups.load(Ordering::SeqCst), 1);

        cache.refresh().await;
        assert!(cache.get_or_fetch(Uuid::from_u128(9)).await.is_none());
        assert_eq!(cache.source.lookups.load(Ordering::SeqCst), 2);
    }

    /// Source whose `fetch_all` reads its entries, then waits for `release`
    #[derive(Default)]
    struct GatedSource {
        inner: StaticReferenceSource,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl ReferenceSource for GatedSource {
        async fn fetch_all(&self) -> Result<Vec<ContentMetadata>, ContractError> {
            let entries = self.inner.fetch_all().await;
            self.entered.notify_one();
            self.release.notified().await;
            entries
        }

        async fn fetch_one(&self, content_id: Uuid) -> Result<Option<ContentMetadata>, ContractError> {
            self.inner.fetch_one(content_id).await
        }
    }

    #[tokio::test]
    async fn point_fetch_during_refresh_survives_the_swap() {
        let source = GatedSource::default();
        source.inner.upsert(newsletter(1, "Weekly"));
        let cache = Arc::new(ReferenceCache::new(source, true));
        cache.source.release.notify_one();
        assert!(cache.refresh().await);
        cache.source.entered.notified().await;

        // Filled before the next refresh starts, then removed upstream
        cache.source.inner.upsert(newsletter(2, "Retired"));
        assert!(cache.get_or_fetch(Uuid::from_u128(2)).await.is_some());
        cache.source.inner.remove(Uuid::from_u128(2));

        let refresh = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.refresh().await }
        });
        cache.source.entered.notified().await;

        cache.source.inner.upsert(newsletter(7, "Late arrival"));
        assert!(cache.get_or_fetch(Uuid::from_u128(7)).await.is_some());

        cache.source.release.notify_one();
        assert!(refresh.await.unwrap());

        assert!(cache.get(Uuid::from_u128(1)).is_some());
        assert_eq!(cache.get(Uuid::from_u128(7)).unwrap().title, "Late arrival");
        assert!(cache.get(Uuid::from_u128(2)).is_none());
    }

    #[tokio::test]
    async fn lookup_errors_degrade_to_absent() {
        let source = FlakySource::default();
        source.failing.store(true, Ordering::SeqCst);
        let cache = ReferenceCache::new(source, true);
        assert!(cache.get_or_fetch(Uuid::from_u128(3)).await.is_none());
    }

    #[tokio::test]
    async fn fetch_on_miss_disabled_never_calls_source() {
        let cache = ReferenceCache::new(FlakySource::default(), false);
        assert!(cache.get_or_fetch(Uuid::from_u128(3)).await.is_none());
        assert_eq!(cache.source.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_picks_up_changes_and_stops() {
        let source = StaticReferenceSource::new([newsletter(1, "Weekly")]);
        let cache = Arc::new(ReferenceCache::new(source.clone(), false));
        let (tx, rx) = watch::channel(false);
        let handle = cache.spawn_refresh_loop(Duration::from_secs(60), rx);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.snapshot().len(), 1);

        source.upsert(newsletter(2, "Daily"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(cache.snapshot().len(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
