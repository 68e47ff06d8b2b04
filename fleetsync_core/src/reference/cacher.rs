use crate::config::ReferenceCacheConfig;
use crate::entities::ReferenceEntity;
use crate::models::{FeedVersion, ServiceKind};
use crate::traits::{FeedRequest, ReferenceSource};
use crate::{Error, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheOperation {
    None,
    Refresh,
    Update,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Another caller is already updating this cache.
    AlreadyInFlight,
    NotRequired,
    Refreshed { count: usize },
    Updated { changed: usize },
}

impl UpdateOutcome {
    pub fn did_work(&self) -> bool {
        matches!(self, UpdateOutcome::Refreshed { .. } | UpdateOutcome::Updated { .. })
    }
}

/// Immutable view of the cache at one point in time.
#[derive(Debug)]
pub struct CacheSnapshot<T> {
    items: HashMap<String, T>,
    last_feed_version: Option<FeedVersion>,
    last_refreshed_at: Option<DateTime<Utc>>,
    last_updated_at: Option<DateTime<Utc>>,
}

impl<T> Default for CacheSnapshot<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            last_feed_version: None,
            last_refreshed_at: None,
            last_updated_at: None,
        }
    }
}

impl<T> CacheSnapshot<T> {
    pub fn items(&self) -> &HashMap<String, T> {
        &self.items
    }

    pub fn last_feed_version(&self) -> Option<FeedVersion> {
        self.last_feed_version
    }

    pub fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed_at
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated_at
    }
}

#[derive(Debug)]
struct Propagation<T> {
    pending: HashMap<String, T>,
    last_propagated_at: Option<DateTime<Utc>>,
}

/// Most recent instant at or before `now` that lies on the grid
/// `anchor + k * interval`, where `anchor` is the latest occurrence of `daily_reference_time`
/// at or before `now`.
pub fn last_boundary(
    now: DateTime<Utc>,
    daily_reference_time: NaiveTime,
    interval_minutes: u32,
) -> DateTime<Utc> {
    let mut anchor = now.date_naive().and_time(daily_reference_time).and_utc();
    if anchor > now {
        anchor -= Duration::days(1);
    }
    let interval = i64::from(interval_minutes.max(1)) * 60;
    let elapsed = (now - anchor).num_seconds();
    anchor + Duration::seconds((elapsed / interval) * interval)
}

/// Decide what a cache with the given timestamps needs at `now`.
pub fn required_operation_for(
    config: &ReferenceCacheConfig,
    last_refreshed_at: Option<DateTime<Utc>>,
    last_updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> CacheOperation {
    let Some(refreshed) = last_refreshed_at else {
        return CacheOperation::Refresh;
    };
    let refresh_boundary = last_boundary(
        now,
        config.daily_reference_time,
        config.refresh_interval_minutes,
    );
    if refreshed < refresh_boundary {
        return CacheOperation::Refresh;
    }
    let update_boundary = last_boundary(
        now,
        config.daily_reference_time,
        config.update_interval_minutes,
    );
    let latest = last_updated_at.map_or(refreshed, |u| u.max(refreshed));
    if latest < update_boundary {
        return CacheOperation::Update;
    }
    CacheOperation::None
}

struct UpdatingFlag<'a>(&'a watch::Sender<bool>);

impl<'a> UpdatingFlag<'a> {
    fn raise(tx: &'a watch::Sender<bool>) -> Self {
        tx.send_replace(true);
        Self(tx)
    }
}

impl Drop for UpdatingFlag<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

/// In-memory mirror of one reference collection.
///
/// Readers load the current snapshot without blocking. Refresh and update build a complete
/// replacement off to the side and publish it with a single atomic swap.
pub struct ReferenceObjectCacher<T> {
    service: ServiceKind,
    source: Arc<dyn ReferenceSource<T>>,
    config: ReferenceCacheConfig,
    snapshot: ArcSwap<CacheSnapshot<T>>,
    update_lock: Mutex<()>,
    updating: watch::Sender<bool>,
    propagation: Mutex<Propagation<T>>,
}

impl<T> ReferenceObjectCacher<T>
where
    T: ReferenceEntity + PartialEq,
{
    pub fn new(
        service: ServiceKind,
        source: Arc<dyn ReferenceSource<T>>,
        config: ReferenceCacheConfig,
    ) -> Self {
        let (updating, _) = watch::channel(false);
        Self {
            service,
            source,
            config,
            snapshot: ArcSwap::from_pointee(CacheSnapshot::default()),
            update_lock: Mutex::new(()),
            updating,
            propagation: Mutex::new(Propagation {
                pending: HashMap::new(),
                last_propagated_at: None,
            }),
        }
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    pub fn config(&self) -> &ReferenceCacheConfig {
        &self.config
    }

    pub fn required_operation(&self, now: DateTime<Utc>) -> CacheOperation {
        let snap = self.snapshot.load();
        required_operation_for(
            &self.config,
            snap.last_refreshed_at,
            snap.last_updated_at,
            now,
        )
    }

    /// Discard everything and repopulate from the source.
    ///
    /// Waits for any in-flight operation and raises the updating flag while it runs.
    #[tracing::instrument(level = "debug", skip(self), fields(entity_type = %T::ENTITY_TYPE))]
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<usize> {
        let _serialized = self.update_lock.lock().await;
        let _flag = UpdatingFlag::raise(&self.updating);
        self.refresh_locked(now).await
    }

    /// Apply additions and changes since the last operation. Never removes items.
    #[tracing::instrument(level = "debug", skip(self), fields(entity_type = %T::ENTITY_TYPE))]
    pub async fn update(&self, now: DateTime<Utc>) -> Result<usize> {
        let _serialized = self.update_lock.lock().await;
        let _flag = UpdatingFlag::raise(&self.updating);
        self.update_locked(now).await
    }

    /// Caller holds `update_lock`.
    async fn refresh_locked(&self, now: DateTime<Utc>) -> Result<usize> {
        let (items, version) = if self.config.use_feed {
            let (changes, version) = self.pull_changes(None).await?;
            let mut items = HashMap::with_capacity(changes.len());
            for item in changes {
                items.insert(item.id().to_string(), item);
            }
            (items, version)
        } else {
            let all = self.source.get_all().await?;
            let items: HashMap<String, T> = all
                .into_iter()
                .map(|item| (item.id().to_string(), item))
                .collect();
            (items, None)
        };

        let count = items.len();
        {
            let mut propagation = self.propagation.lock().await;
            propagation.pending = items.clone();
        }
        self.snapshot.store(Arc::new(CacheSnapshot {
            items,
            last_feed_version: version,
            last_refreshed_at: Some(now),
            last_updated_at: Some(now),
        }));
        tracing::info!(
            entity_type = %T::ENTITY_TYPE,
            count,
            feed_version = ?version,
            "reference cache refreshed"
        );
        Ok(count)
    }

    /// Caller holds `update_lock`.
    async fn update_locked(&self, now: DateTime<Utc>) -> Result<usize> {
        let current = self.snapshot.load_full();
        let (changed, version): (Vec<T>, Option<FeedVersion>) = if self.config.use_feed {
            let (changes, version) = self.pull_changes(current.last_feed_version).await?;
            (changes, version.or(current.last_feed_version))
        } else {
            let all = self.source.get_all().await?;
            let changed = all
                .into_iter()
                .filter(|item| current.items.get(item.id()) != Some(item))
                .collect();
            (changed, current.last_feed_version)
        };

        let mut items = current.items.clone();
        {
            let mut propagation = self.propagation.lock().await;
            for item in &changed {
                let id = item.id().to_string();
                propagation.pending.insert(id.clone(), item.clone());
                items.insert(id, item.clone());
            }
        }
        self.snapshot.store(Arc::new(CacheSnapshot {
            items,
            last_feed_version: version,
            last_refreshed_at: current.last_refreshed_at,
            last_updated_at: Some(now),
        }));
        tracing::debug!(
            entity_type = %T::ENTITY_TYPE,
            count = changed.len(),
            "reference cache updated"
        );
        Ok(changed.len())
    }

    /// Perform whatever `now` requires. A call made while another is in flight does nothing.
    #[tracing::instrument(level = "debug", skip(self), fields(entity_type = %T::ENTITY_TYPE))]
    pub async fn update_if_required(&self, now: DateTime<Utc>) -> Result<UpdateOutcome> {
        let Ok(_serialized) = self.update_lock.try_lock() else {
            tracing::debug!(
                entity_type = %T::ENTITY_TYPE,
                "reference cache update already in flight"
            );
            return Ok(UpdateOutcome::AlreadyInFlight);
        };
        let operation = self.required_operation(now);
        if operation == CacheOperation::None {
            return Ok(UpdateOutcome::NotRequired);
        }
        let _flag = UpdatingFlag::raise(&self.updating);
        match operation {
            CacheOperation::Refresh => Ok(UpdateOutcome::Refreshed {
                count: self.refresh_locked(now).await?,
            }),
            CacheOperation::Update => Ok(UpdateOutcome::Updated {
                changed: self.update_locked(now).await?,
            }),
            CacheOperation::None => Ok(UpdateOutcome::NotRequired),
        }
    }

    pub fn is_updating(&self) -> bool {
        *self.updating.borrow()
    }

    /// Wait until no update is in flight.
    pub async fn wait_if_updating(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.updating.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = rx.wait_for(|updating| !*updating) => {
                // The sender lives as long as `self`, so a closed channel cannot happen here.
                res.map(|_| ()).map_err(|e| Error::backend("reference cache update flag", e))
            }
        }
    }

    /// Drain the items changed since the last call, stamping the propagation time.
    pub async fn take_changes_for_propagation(&self, now: DateTime<Utc>) -> Vec<T> {
        let mut propagation = self.propagation.lock().await;
        propagation.last_propagated_at = Some(now);
        propagation.pending.drain().map(|(_, item)| item).collect()
    }

    /// Put back changes whose propagation failed. Newer pending versions win.
    pub async fn requeue_changes(&self, changes: Vec<T>) {
        let mut propagation = self.propagation.lock().await;
        for item in changes {
            propagation
                .pending
                .entry(item.id().to_string())
                .or_insert(item);
        }
    }

    pub async fn last_propagated_at(&self) -> Option<DateTime<Utc>> {
        self.propagation.lock().await.last_propagated_at
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot<T>> {
        self.snapshot.load_full()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.snapshot.load().items.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot.load().items.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.snapshot.load().items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot.load().last_refreshed_at.is_some()
    }

    pub fn last_feed_version(&self) -> Option<FeedVersion> {
        self.snapshot.load().last_feed_version
    }

    /// Page through the source feed until a short batch arrives.
    async fn pull_changes(
        &self,
        from: Option<FeedVersion>,
    ) -> Result<(Vec<T>, Option<FeedVersion>)> {
        let limit = self.config.feed_results_limit.max(1);
        let mut version = from;
        let mut out = Vec::new();
        loop {
            let batch = self
                .source
                .pull(FeedRequest::FromVersion(version), limit)
                .await?;
            let full = batch.data.len() >= limit;
            let advanced = version.is_none_or(|v| batch.to_version > v);
            out.extend(batch.data);
            version = Some(batch.to_version);
            if !full {
                break;
            }
            if !advanced {
                tracing::warn!(
                    entity_type = %T::ENTITY_TYPE,
                    feed_version = %batch.to_version,
                    "reference feed returned a full batch without advancing; stopping"
                );
                break;
            }
        }
        Ok((out, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Device;
    use crate::memory::StaticReferenceSource;
    use crate::traits::FeedBatch;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::Notify;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 0).unwrap()
    }

    fn device(id: &str, name: &str) -> Device {
        Device {
            id: id.into(),
            name: name.into(),
            serial_number: None,
            device_type: None,
            active_from: None,
            active_to: None,
            version: None,
        }
    }

    fn config(update: u32, refresh: u32, use_feed: bool) -> ReferenceCacheConfig {
        ReferenceCacheConfig {
            daily_reference_time: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            update_interval_minutes: update,
            refresh_interval_minutes: refresh,
            feed_results_limit: 2,
            use_feed,
        }
    }

    #[test]
    fn boundaries_anchor_on_daily_reference_time() {
        let t = NaiveTime::from_hms_opt(2, 0, 0).unwrap();
        assert_eq!(last_boundary(at(3, 7), t, 5), at(3, 5));
        assert_eq!(last_boundary(at(3, 7), t, 24 * 60), at(2, 0));
        // Before the reference time the anchor is yesterday's.
        assert_eq!(
            last_boundary(at(1, 30), t, 24 * 60),
            Utc.with_ymd_and_hms(2024, 3, 9, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn required_operation_boundaries() {
        let cfg = config(5, 24 * 60, false);
        assert_eq!(
            required_operation_for(&cfg, None, None, at(3, 0)),
            CacheOperation::Refresh
        );
        // Refreshed before today's reference time: refresh again.
        assert_eq!(
            required_operation_for(&cfg, Some(at(1, 59)), Some(at(1, 59)), at(2, 1)),
            CacheOperation::Refresh
        );
        // Crossed an update boundary only.
        assert_eq!(
            required_operation_for(&cfg, Some(at(2, 1)), Some(at(2, 3)), at(2, 6)),
            CacheOperation::Update
        );
        // Nothing crossed.
        assert_eq!(
            required_operation_for(&cfg, Some(at(2, 1)), Some(at(2, 6)), at(2, 9)),
            CacheOperation::None
        );
    }

    #[test]
    fn refresh_supersedes_update_when_both_are_due() {
        let cfg = config(5, 60, false);
        assert_eq!(
            required_operation_for(&cfg, Some(at(2, 30)), Some(at(2, 58)), at(3, 1)),
            CacheOperation::Refresh
        );
    }

    #[tokio::test]
    async fn refresh_then_update_via_listing() {
        let source = Arc::new(StaticReferenceSource::new(vec![
            device("b1", "one"),
            device("b2", "two"),
        ]));
        let cacher = ReferenceObjectCacher::new(
            ServiceKind::DeviceCache,
            source.clone(),
            config(5, 24 * 60, false),
        );
        assert!(!cacher.is_initialized());

        assert_eq!(
            cacher.update_if_required(at(3, 0)).await.unwrap(),
            UpdateOutcome::Refreshed { count: 2 }
        );
        assert_eq!(cacher.take_changes_for_propagation(at(3, 0)).await.len(), 2);
        assert_eq!(
            cacher.update_if_required(at(3, 1)).await.unwrap(),
            UpdateOutcome::NotRequired
        );

        source.upsert(device("b1", "renamed")).await;
        source.upsert(device("b3", "three")).await;
        source.remove("b2").await;
        assert_eq!(
            cacher.update_if_required(at(3, 6)).await.unwrap(),
            UpdateOutcome::Updated { changed: 2 }
        );
        // Updates never remove.
        assert!(cacher.contains("b2"));
        assert_eq!(cacher.get("b1").unwrap().name, "renamed");
        let mut delta: Vec<String> = cacher
            .take_changes_for_propagation(at(3, 6))
            .await
            .into_iter()
            .map(|d| d.id)
            .collect();
        delta.sort();
        assert_eq!(delta, vec!["b1", "b3"]);
        assert_eq!(cacher.last_propagated_at().await, Some(at(3, 6)));

        // The next refresh drops it.
        cacher.refresh(at(4, 0)).await.unwrap();
        assert!(!cacher.contains("b2"));
        assert_eq!(cacher.len(), 2);
    }

    #[tokio::test]
    async fn feed_mode_pages_until_short_batch() {
        let source = Arc::new(StaticReferenceSource::new(vec![
            device("b1", "one"),
            device("b2", "two"),
            device("b3", "three"),
        ]));
        let cacher = ReferenceObjectCacher::new(
            ServiceKind::DeviceCache,
            source.clone(),
            config(5, 24 * 60, true),
        );
        assert_eq!(cacher.refresh(at(3, 0)).await.unwrap(), 3);
        assert_eq!(cacher.last_feed_version(), Some(FeedVersion(3)));
        assert_eq!(source.get_all_calls(), 0);

        source.upsert(device("b2", "changed")).await;
        assert_eq!(cacher.update(at(3, 5)).await.unwrap(), 1);
        assert_eq!(cacher.last_feed_version(), Some(FeedVersion(4)));
        assert_eq!(cacher.get("b2").unwrap().name, "changed");
    }

    #[tokio::test]
    async fn failed_propagation_can_be_requeued() {
        let source = Arc::new(StaticReferenceSource::new(vec![device("b1", "one")]));
        let cacher =
            ReferenceObjectCacher::new(ServiceKind::DeviceCache, source, config(5, 60, false));
        cacher.refresh(at(3, 0)).await.unwrap();
        let changes = cacher.take_changes_for_propagation(at(3, 0)).await;
        cacher.requeue_changes(changes).await;
        assert_eq!(cacher.take_changes_for_propagation(at(3, 1)).await.len(), 1);
        assert!(cacher.take_changes_for_propagation(at(3, 2)).await.is_empty());
    }

    /// Listing that blocks until released.
    struct GatedSource {
        gate: Notify,
        items: Vec<Device>,
    }

    #[async_trait]
    impl ReferenceSource<Device> for GatedSource {
        async fn get_all(&self) -> Result<Vec<Device>> {
            self.gate.notified().await;
            Ok(self.items.clone())
        }

        async fn pull(&self, _request: FeedRequest, _limit: usize) -> Result<FeedBatch<Device>> {
            Err(Error::BackendMessage("not used".into()))
        }
    }

    #[tokio::test]
    async fn concurrent_updates_are_noops_and_swap_is_atomic() {
        let source = Arc::new(GatedSource {
            gate: Notify::new(),
            items: vec![device("b1", "one"), device("b2", "two"), device("b3", "three")],
        });
        let cacher = Arc::new(ReferenceObjectCacher::new(
            ServiceKind::DeviceCache,
            source.clone(),
            config(5, 60, false),
        ));

        let first = {
            let cacher = cacher.clone();
            tokio::spawn(async move { cacher.update_if_required(at(3, 0)).await })
        };
        while !cacher.is_updating() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            cacher.update_if_required(at(3, 0)).await.unwrap(),
            UpdateOutcome::AlreadyInFlight
        );
        // Readers keep seeing the previous, empty snapshot until the swap.
        assert_eq!(cacher.len(), 0);
        assert!(!cacher.is_initialized());

        source.gate.notify_one();
        assert_eq!(
            first.await.unwrap().unwrap(),
            UpdateOutcome::Refreshed { count: 3 }
        );
        assert_eq!(cacher.len(), 3);
        assert!(!cacher.is_updating());
        cacher
            .wait_if_updating(&CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn explicit_refresh_is_serialized_with_scheduled_updates() {
        let source = Arc::new(GatedSource {
            gate: Notify::new(),
            items: vec![device("b1", "one"), device("b2", "two")],
        });
        let cacher = Arc::new(ReferenceObjectCacher::new(
            ServiceKind::DeviceCache,
            source.clone(),
            config(5, 60, false),
        ));

        let refresh = {
            let cacher = cacher.clone();
            tokio::spawn(async move { cacher.refresh(at(3, 0)).await })
        };
        while !cacher.is_updating() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            cacher.update_if_required(at(3, 0)).await.unwrap(),
            UpdateOutcome::AlreadyInFlight
        );

        let waiter = {
            let cacher = cacher.clone();
            tokio::spawn(async move { cacher.wait_if_updating(&CancellationToken::new()).await })
        };
        source.gate.notify_one();
        assert_eq!(refresh.await.unwrap().unwrap(), 2);
        waiter.await.unwrap().unwrap();
        assert!(!cacher.is_updating());
        assert_eq!(cacher.len(), 2);
    }

    #[tokio::test]
    async fn updating_flag_clears_on_error() {
        let source = Arc::new(StaticReferenceSource::<Device>::new(vec![]));
        source.fail_next(crate::memory::ScriptedFailure::Backend("boom".into()));
        let cacher = ReferenceObjectCacher::new(
            ServiceKind::DeviceCache,
            source,
            config(5, 60, false),
        );
        assert!(cacher.update_if_required(at(3, 0)).await.is_err());
        assert!(!cacher.is_updating());
        assert!(!cacher.is_initialized());
    }
}
