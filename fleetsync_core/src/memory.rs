//! In-memory backends for local development and unit tests.
//!
//! Semantics:
//! - every store keeps its data for the process lifetime only
//! - feed sources number their records 1..=n and use that number as the feed version
//! - failures can be scripted per call to exercise recovery paths

use crate::entities::{FactEntity, ReferenceEntity};
use crate::environment::AdapterVersion;
use crate::models::{FeedVersion, ServiceKind, ServiceTrackingRecord};
use crate::traits::{
    FactStore, FeedBatch, FeedRequest, FeedSource, LivenessProbe, MaintenanceStore,
    ReferenceSource, ReferenceStore, ServiceTracker,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Liveness probe with a switchable outcome.
#[derive(Debug)]
pub struct StaticProbe {
    name: &'static str,
    healthy: AtomicBool,
}

impl StaticProbe {
    pub fn healthy(name: &'static str) -> Self {
        Self {
            name,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn failing(name: &'static str) -> Self {
        Self {
            name,
            healthy: AtomicBool::new(false),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl LivenessProbe for StaticProbe {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn probe(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::BackendMessage(format!("{} is unreachable", self.name)))
        }
    }
}

/// Failure injected into the next call of a memory store or source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    ForeignKey(Option<String>),
    Backend(String),
}

impl ScriptedFailure {
    fn into_error(self) -> Error {
        match self {
            ScriptedFailure::ForeignKey(constraint) => Error::ForeignKeyViolation {
                constraint,
                message: "FOREIGN KEY constraint failed".to_string(),
            },
            ScriptedFailure::Backend(message) => Error::BackendMessage(message),
        }
    }
}

#[derive(Debug, Default)]
struct FailureScript {
    queue: std::sync::Mutex<VecDeque<ScriptedFailure>>,
}

impl FailureScript {
    fn push(&self, failure: ScriptedFailure) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(failure);
        }
    }

    fn take(&self) -> Result<()> {
        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(f) => Err(f.into_error()),
            None => Ok(()),
        }
    }
}

/// In-memory tracking table. Doubles as the "database" liveness probe in local runs.
#[derive(Clone, Default)]
pub struct MemoryServiceTracker {
    records: Arc<Mutex<BTreeMap<ServiceKind, ServiceTrackingRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryServiceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is (tests seed foreign machines this way).
    pub async fn insert(&self, record: ServiceTrackingRecord) {
        self.records.lock().await.insert(record.service, record);
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BackendMessage("database is unreachable".to_string()));
        }
        Ok(())
    }

    async fn update(
        &self,
        service: ServiceKind,
        f: impl FnOnce(&mut ServiceTrackingRecord),
    ) -> Result<()> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&service)
            .ok_or(Error::ServiceNotRegistered(service))?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl ServiceTracker for MemoryServiceTracker {
    async fn tracking_records(&self) -> Result<Vec<ServiceTrackingRecord>> {
        self.check_available()?;
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn tracking_record(&self, service: ServiceKind) -> Result<Option<ServiceTrackingRecord>> {
        self.check_available()?;
        Ok(self.records.lock().await.get(&service).cloned())
    }

    async fn register_service(
        &self,
        service: ServiceKind,
        started_at: DateTime<Utc>,
    ) -> Result<ServiceTrackingRecord> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let record = records
            .entry(service)
            .or_insert_with(|| ServiceTrackingRecord::new(service));
        record.started_at = Some(started_at);
        Ok(record.clone())
    }

    async fn stamp_identity(
        &self,
        service: ServiceKind,
        version: &AdapterVersion,
        machine_name: &str,
    ) -> Result<()> {
        let version = version.clone();
        let machine_name = machine_name.to_string();
        self.update(service, move |r| {
            r.adapter_version = Some(version);
            r.adapter_machine_name = Some(machine_name);
        })
        .await
    }

    async fn heartbeat(&self, service: ServiceKind, at: DateTime<Utc>) -> Result<()> {
        self.update(service, |r| r.last_heartbeat_at = Some(at)).await
    }

    async fn record_processed(
        &self,
        service: ServiceKind,
        feed_version: Option<FeedVersion>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(service, |r| {
            r.entities_last_processed_at = Some(at);
            if feed_version.is_some() {
                r.last_processed_feed_version = feed_version;
            }
        })
        .await
    }

    async fn rewrite_cursor(
        &self,
        service: ServiceKind,
        feed_version: Option<FeedVersion>,
    ) -> Result<()> {
        self.update(service, |r| r.last_processed_feed_version = feed_version)
            .await
    }
}

#[async_trait]
impl LivenessProbe for MemoryServiceTracker {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn probe(&self) -> Result<()> {
        self.check_available()
    }
}

#[async_trait]
impl MaintenanceStore for MemoryServiceTracker {
    async fn run_maintenance(&self) -> Result<()> {
        self.check_available()
    }
}

/// Fact table keyed by id. Every commit advances the cursor in the shared tracker.
pub struct MemoryFactStore<T> {
    tracker: MemoryServiceTracker,
    rows: Mutex<BTreeMap<String, T>>,
    commits: Mutex<Vec<Vec<String>>>,
    failures: FailureScript,
}

impl<T: FactEntity> MemoryFactStore<T> {
    pub fn new(tracker: MemoryServiceTracker) -> Self {
        Self {
            tracker,
            rows: Mutex::new(BTreeMap::new()),
            commits: Mutex::new(Vec::new()),
            failures: FailureScript::default(),
        }
    }

    /// Fail the next `persist` call.
    pub fn fail_next(&self, failure: ScriptedFailure) {
        self.failures.push(failure);
    }

    pub async fn rows(&self) -> Vec<T> {
        self.rows.lock().await.values().cloned().collect()
    }

    /// Ids written by each successful commit, in commit order.
    pub async fn commits(&self) -> Vec<Vec<String>> {
        self.commits.lock().await.clone()
    }
}

#[async_trait]
impl<T: FactEntity> FactStore<T> for MemoryFactStore<T> {
    async fn persist(
        &self,
        service: ServiceKind,
        batch: &[T],
        to_version: FeedVersion,
        processed_at: DateTime<Utc>,
    ) -> Result<u64> {
        self.failures.take()?;
        self.tracker.check_available()?;
        {
            let mut rows = self.rows.lock().await;
            for item in batch {
                rows.insert(item.id().to_string(), item.clone());
            }
        }
        self.commits
            .lock()
            .await
            .push(batch.iter().map(|i| i.id().to_string()).collect());
        self.tracker
            .record_processed(service, Some(to_version), processed_at)
            .await?;
        Ok(batch.len() as u64)
    }
}

/// Reference table keyed by id.
pub struct MemoryReferenceStore<T> {
    items: Mutex<BTreeMap<String, T>>,
    failures: FailureScript,
}

impl<T: ReferenceEntity> Default for MemoryReferenceStore<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            failures: FailureScript::default(),
        }
    }
}

impl<T: ReferenceEntity> MemoryReferenceStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, failure: ScriptedFailure) {
        self.failures.push(failure);
    }

    pub async fn items(&self) -> Vec<T> {
        self.items.lock().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.items.lock().await.contains_key(id)
    }
}

#[async_trait]
impl<T: ReferenceEntity> ReferenceStore<T> for MemoryReferenceStore<T> {
    async fn upsert(&self, items: &[T], _at: DateTime<Utc>) -> Result<u64> {
        self.failures.take()?;
        let mut stored = self.items.lock().await;
        for item in items {
            stored.insert(item.id().to_string(), item.clone());
        }
        Ok(items.len() as u64)
    }
}

/// Append-only fact feed. Record `n` (1-based) carries feed version `n`.
pub struct ScriptedFeedSource<T> {
    log: Mutex<Vec<T>>,
    requests: Mutex<Vec<FeedRequest>>,
    failures: FailureScript,
}

impl<T: FactEntity> Default for ScriptedFeedSource<T> {
    fn default() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            failures: FailureScript::default(),
        }
    }
}

impl<T: FactEntity> ScriptedFeedSource<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<T>) -> Self {
        Self {
            log: Mutex::new(records),
            ..Self::default()
        }
    }

    pub async fn push(&self, records: impl IntoIterator<Item = T>) {
        self.log.lock().await.extend(records);
    }

    pub fn fail_next(&self, failure: ScriptedFailure) {
        self.failures.push(failure);
    }

    /// Every request received, failed ones included.
    pub async fn requests(&self) -> Vec<FeedRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.len()
    }
}

#[async_trait]
impl<T: FactEntity> FeedSource<T> for ScriptedFeedSource<T> {
    async fn pull(&self, request: FeedRequest, results_limit: usize) -> Result<FeedBatch<T>> {
        self.requests.lock().await.push(request);
        self.failures.take()?;

        let log = self.log.lock().await;
        let start = match request {
            FeedRequest::FromVersion(None) => 0,
            FeedRequest::FromVersion(Some(v)) => usize::try_from(v.0.max(0)).unwrap_or(usize::MAX),
            FeedRequest::FromDate(at) => log
                .iter()
                .position(|r| r.date_time() >= at)
                .unwrap_or(log.len()),
        };
        let start = start.min(log.len());
        let end = start.saturating_add(results_limit).min(log.len());
        let data = log[start..end].to_vec();
        let to_version = match request {
            // An empty date-seeded pull still reports the head of the feed.
            FeedRequest::FromDate(_) if data.is_empty() => FeedVersion(log.len() as i64),
            _ => FeedVersion(end as i64),
        };
        Ok(FeedBatch { to_version, data })
    }
}

/// Reference source backed by a change log: `get_all` lists current items, `pull` replays
/// changes after a version.
pub struct StaticReferenceSource<T> {
    changes: Mutex<Vec<T>>,
    removed: Mutex<Vec<String>>,
    get_all_calls: AtomicUsize,
    failures: FailureScript,
}

impl<T: ReferenceEntity> Default for StaticReferenceSource<T> {
    fn default() -> Self {
        Self {
            changes: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            get_all_calls: AtomicUsize::new(0),
            failures: FailureScript::default(),
        }
    }
}

impl<T: ReferenceEntity> StaticReferenceSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            changes: Mutex::new(items),
            ..Self::default()
        }
    }

    /// Add or change an item.
    pub async fn upsert(&self, item: T) {
        let id = item.id().to_string();
        self.removed.lock().await.retain(|r| r != &id);
        self.changes.lock().await.push(item);
    }

    /// Remove an item from future listings. Feeds never report removals.
    pub async fn remove(&self, id: &str) {
        self.removed.lock().await.push(id.to_string());
    }

    pub fn fail_next(&self, failure: ScriptedFailure) {
        self.failures.push(failure);
    }

    pub fn get_all_calls(&self) -> usize {
        self.get_all_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: ReferenceEntity> ReferenceSource<T> for StaticReferenceSource<T> {
    async fn get_all(&self) -> Result<Vec<T>> {
        self.get_all_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.take()?;
        let changes = self.changes.lock().await;
        let removed = self.removed.lock().await;
        let mut latest: HashMap<&str, &T> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        for item in changes.iter() {
            if latest.insert(item.id(), item).is_none() {
                order.push(item.id());
            }
        }
        Ok(order
            .into_iter()
            .filter(|id| !removed.iter().any(|r| r == id))
            .filter_map(|id| latest.get(id).map(|item| (*item).clone()))
            .collect())
    }

    async fn pull(&self, request: FeedRequest, results_limit: usize) -> Result<FeedBatch<T>> {
        self.failures.take()?;
        let changes = self.changes.lock().await;
        let start = match request {
            FeedRequest::FromVersion(Some(v)) => usize::try_from(v.0.max(0)).unwrap_or(usize::MAX),
            FeedRequest::FromVersion(None) | FeedRequest::FromDate(_) => 0,
        };
        let start = start.min(changes.len());
        let end = start.saturating_add(results_limit).min(changes.len());
        Ok(FeedBatch {
            to_version: FeedVersion(end as i64),
            data: changes[start..end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Device, LogRecord};
    use chrono::TimeZone;

    fn log_record(n: i64) -> LogRecord {
        LogRecord {
            id: format!("l{n}"),
            device_id: "b1".into(),
            date_time: Utc.timestamp_opt(1_700_000_000 + n * 60, 0).unwrap(),
            latitude: 0.0,
            longitude: 0.0,
            speed: 0.0,
        }
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

    #[tokio::test]
    async fn feed_source_pages_by_version() {
        let source = ScriptedFeedSource::with_records((1..=5).map(log_record).collect());
        let first = source.pull(FeedRequest::FromVersion(None), 2).await.unwrap();
        assert_eq!(first.to_version, FeedVersion(2));
        assert_eq!(first.data.len(), 2);

        let rest = source
            .pull(FeedRequest::FromVersion(Some(first.to_version)), 10)
            .await
            .unwrap();
        assert_eq!(rest.to_version, FeedVersion(5));
        assert_eq!(rest.data[0].id, "l3");

        let empty = source
            .pull(FeedRequest::FromVersion(Some(FeedVersion(5))), 10)
            .await
            .unwrap();
        assert!(empty.data.is_empty());
        assert_eq!(empty.to_version, FeedVersion(5));
    }

    #[tokio::test]
    async fn feed_source_seeks_by_date() {
        let source = ScriptedFeedSource::with_records((1..=5).map(log_record).collect());
        let at = log_record(4).date_time;
        let batch = source.pull(FeedRequest::FromDate(at), 10).await.unwrap();
        assert_eq!(batch.data.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["l4", "l5"]);

        let later = Utc.timestamp_opt(1_900_000_000, 0).unwrap();
        let batch = source.pull(FeedRequest::FromDate(later), 10).await.unwrap();
        assert!(batch.data.is_empty());
        assert_eq!(batch.to_version, FeedVersion(5));
    }

    #[tokio::test]
    async fn reference_source_lists_latest_without_removed() {
        let source = StaticReferenceSource::new(vec![device("b1", "one"), device("b2", "two")]);
        source.upsert(device("b1", "one-renamed")).await;
        source.remove("b2").await;
        let all = source.get_all().await.unwrap();
        assert_eq!(all, vec![device("b1", "one-renamed")]);

        let changes = source
            .pull(FeedRequest::FromVersion(Some(FeedVersion(2))), 10)
            .await
            .unwrap();
        assert_eq!(changes.data, vec![device("b1", "one-renamed")]);
        assert_eq!(changes.to_version, FeedVersion(3));
    }

    #[tokio::test]
    async fn fact_store_commits_and_advances_cursor() {
        let tracker = MemoryServiceTracker::new();
        tracker
            .register_service(ServiceKind::LogRecordFeed, Utc::now())
            .await
            .unwrap();
        let store = MemoryFactStore::new(tracker.clone());

        store.fail_next(ScriptedFailure::ForeignKey(Some("fk_x".into())));
        let err = store
            .persist(ServiceKind::LogRecordFeed, &[log_record(1)], FeedVersion(1), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ForeignKeyViolation { .. }));

        store
            .persist(ServiceKind::LogRecordFeed, &[log_record(1)], FeedVersion(1), Utc::now())
            .await
            .unwrap();
        let record = tracker
            .tracking_record(ServiceKind::LogRecordFeed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.last_processed_feed_version, Some(FeedVersion(1)));
        assert_eq!(store.commits().await, vec![vec!["l1".to_string()]]);
    }

    #[tokio::test]
    async fn tracker_rejects_unregistered_updates() {
        let tracker = MemoryServiceTracker::new();
        assert!(matches!(
            tracker.heartbeat(ServiceKind::DeviceCache, Utc::now()).await,
            Err(Error::ServiceNotRegistered(ServiceKind::DeviceCache))
        ));
        tracker.set_unavailable(true);
        assert!(tracker.probe().await.is_err());
    }
}
