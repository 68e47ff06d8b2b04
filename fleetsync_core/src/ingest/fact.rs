use crate::config::FeedConfig;
use crate::coordination::{ForeignKeyServiceDependencyMap, IntervalWaitOutcome, ServiceAwaiter};
use crate::entities::FactEntity;
use crate::feed::{FeedPuller, PollOutcome};
use crate::models::{FeedVersion, ServiceKind};
use crate::pipeline::EntityPipeline;
use crate::traits::{FactStore, FeedSource, ServiceTracker};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builds the pipeline once reference caches are populated.
pub type PipelineFactory<T> = Box<dyn Fn() -> EntityPipeline<T> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Throttled {
        remaining: Duration,
    },
    Committed {
        retrieved: usize,
        kept: usize,
        to_version: FeedVersion,
        full: bool,
    },
}

/// Ingestion loop for one fact feed: poll, filter, sample, commit.
pub struct FactIngestService<T> {
    service: ServiceKind,
    source: Arc<dyn FeedSource<T>>,
    feed_config: FeedConfig,
    store: Arc<dyn FactStore<T>>,
    tracker: Arc<dyn ServiceTracker>,
    awaiter: Arc<ServiceAwaiter>,
    fk_map: Arc<ForeignKeyServiceDependencyMap>,
    prerequisites: Vec<ServiceKind>,
    pipeline_factory: PipelineFactory<T>,
    puller: Option<FeedPuller<T>>,
    pipeline: Option<EntityPipeline<T>>,
}

impl<T: FactEntity> FactIngestService<T> {
    #[tracing::instrument(level = "debug", skip(source, store, tracker, awaiter, feed_config))]
    pub fn new(
        service: ServiceKind,
        source: Arc<dyn FeedSource<T>>,
        feed_config: FeedConfig,
        store: Arc<dyn FactStore<T>>,
        tracker: Arc<dyn ServiceTracker>,
        awaiter: Arc<ServiceAwaiter>,
    ) -> Self {
        Self {
            service,
            source,
            feed_config,
            store,
            tracker,
            awaiter,
            fk_map: Arc::new(ForeignKeyServiceDependencyMap::default()),
            prerequisites: Vec::new(),
            pipeline_factory: Box::new(EntityPipeline::new),
            puller: None,
            pipeline: None,
        }
    }

    pub fn with_fk_map(mut self, fk_map: Arc<ForeignKeyServiceDependencyMap>) -> Self {
        self.fk_map = fk_map;
        self
    }

    /// Services that must be running, with data, before this feed is pulled.
    pub fn with_prerequisites(mut self, prerequisites: Vec<ServiceKind>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn with_pipeline(mut self, factory: PipelineFactory<T>) -> Self {
        self.pipeline_factory = factory;
        self
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    pub fn puller(&self) -> Option<&FeedPuller<T>> {
        self.puller.as_ref()
    }

    /// One pass of the loop. Waits first, then polls and commits.
    #[tracing::instrument(level = "debug", skip(self, cancel), fields(service = %self.service))]
    pub async fn run_iteration(&mut self, cancel: &CancellationToken) -> Result<IterationOutcome> {
        self.awaiter
            .wait_for_connectivity_restoration_if_needed(cancel)
            .await;
        self.awaiter
            .wait_for_database_maintenance_completion_if_needed(cancel)
            .await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.awaiter
            .wait_for_prerequisites_if_needed(&self.prerequisites, true, cancel)
            .await?;

        let now = Utc::now();
        self.tracker.heartbeat(self.service, now).await?;

        let puller = match self.puller.take() {
            Some(puller) => puller,
            None => self.build_puller().await?,
        };
        let puller = self.puller.insert(puller);
        let pipeline = self
            .pipeline
            .get_or_insert_with(|| (self.pipeline_factory)());

        let (to_version, full) = match puller.poll_at(now).await? {
            PollOutcome::Throttled { remaining } => {
                return Ok(IterationOutcome::Throttled { remaining });
            }
            PollOutcome::Retrieved {
                to_version, full, ..
            } => (to_version, full),
        };

        let batch = puller.take_pending_batch();
        let retrieved = batch.len();
        let kept = pipeline.run(batch);
        // Empty batches are committed too so the cursor advances.
        if let Err(e) = self
            .store
            .persist(self.service, &kept, to_version, now)
            .await
        {
            pipeline.discard();
            return Err(e);
        }
        pipeline.commit();

        tracing::info!(
            service = %self.service,
            entity_type = %T::ENTITY_TYPE,
            count = kept.len(),
            retrieved,
            feed_version = %to_version,
            "feed batch committed"
        );
        Ok(IterationOutcome::Committed {
            retrieved,
            kept: kept.len(),
            to_version,
            full,
        })
    }

    /// Run until cancelled. Returns only fatal errors.
    #[tracing::instrument(level = "info", skip_all, fields(service = %self.service))]
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let polling_interval = self.feed_config.polling_interval();
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let wait = match self.run_iteration(&cancel).await {
                Ok(IterationOutcome::Throttled { remaining }) => remaining,
                Ok(IterationOutcome::Committed { full: true, .. }) => Duration::ZERO,
                Ok(IterationOutcome::Committed { .. }) => polling_interval,
                Err(e) => match self.recover(e, &cancel).await {
                    Ok(()) => polling_interval,
                    Err(Error::Cancelled) => return Ok(()),
                    Err(e) => return Err(e),
                },
            };
            if !wait.is_zero()
                && self.awaiter.wait_for_configured_interval(wait, &cancel).await
                    == IntervalWaitOutcome::Cancelled
            {
                return Ok(());
            }
        }
    }

    /// Handle a failed iteration. Fatal errors and cancellation are returned; everything else
    /// rolls the cursor back to the last commit.
    #[tracing::instrument(level = "debug", skip(self, cancel), fields(service = %self.service))]
    pub async fn recover(&mut self, error: Error, cancel: &CancellationToken) -> Result<()> {
        match error {
            Error::Cancelled => return Err(Error::Cancelled),
            e if e.is_fatal() => return Err(e),
            Error::ForeignKeyViolation {
                constraint,
                message,
            } => {
                let failed_at = Utc::now();
                let prerequisite = constraint
                    .as_deref()
                    .and_then(|c| self.fk_map.try_get_dependency(c));
                match prerequisite {
                    Some(prerequisite) => {
                        tracing::warn!(
                            service = %self.service,
                            constraint = ?constraint,
                            prerequisite = %prerequisite,
                            "batch rejected by foreign key; waiting for prerequisite"
                        );
                        match self
                            .awaiter
                            .wait_for_prerequisite_progress(prerequisite, failed_at, cancel)
                            .await
                        {
                            Ok(()) => {}
                            Err(Error::Cancelled) => return Err(Error::Cancelled),
                            Err(e) => {
                                tracing::warn!(
                                    service = %self.service,
                                    error = %e,
                                    "prerequisite wait failed"
                                );
                                self.awaiter.state().diagnose_outage().await;
                            }
                        }
                    }
                    None => {
                        tracing::warn!(
                            service = %self.service,
                            constraint = ?constraint,
                            message = %message,
                            "batch rejected by unmapped foreign key"
                        );
                    }
                }
            }
            e => {
                tracing::warn!(service = %self.service, error = %e, "feed iteration failed");
                self.awaiter.state().diagnose_outage().await;
            }
        }
        self.rollback_to_committed().await;
        Ok(())
    }

    async fn rollback_to_committed(&mut self) {
        match self.tracker.tracking_record(self.service).await {
            Ok(record) => {
                let committed = record.and_then(|r| r.last_processed_feed_version);
                if let Some(puller) = self.puller.as_mut() {
                    puller.rollback(committed);
                }
            }
            Err(e) => {
                // Rebuilt from the tracking record on the next iteration.
                tracing::warn!(
                    service = %self.service,
                    error = %e,
                    "could not read committed cursor"
                );
                self.puller = None;
            }
        }
    }

    async fn build_puller(&self) -> Result<FeedPuller<T>> {
        let record = self
            .tracker
            .tracking_record(self.service)
            .await?
            .ok_or(Error::ServiceNotRegistered(self.service))?;
        tracing::info!(
            service = %self.service,
            feed_version = ?record.last_processed_feed_version,
            start_option = ?self.feed_config.start_option,
            "resuming feed"
        );
        Ok(FeedPuller::new(
            self.source.clone(),
            self.feed_config.clone(),
            record.last_processed_feed_version,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinationConfig, FeedStartOption, SamplingConfig};
    use crate::coordination::{OrchestratorReadiness, PrerequisiteCoordinator, ServicePauseRegistry};
    use crate::entities::LogRecord;
    use crate::memory::{
        MemoryFactStore, MemoryServiceTracker, ScriptedFailure, ScriptedFeedSource, StaticProbe,
    };
    use crate::pipeline::{DeviceFilterer, FilterSet, MinimumIntervalSampler};
    use crate::state::{StateMachine, WaitReason};
    use chrono::TimeZone;

    struct Harness {
        tracker: MemoryServiceTracker,
        source: Arc<ScriptedFeedSource<LogRecord>>,
        store: Arc<MemoryFactStore<LogRecord>>,
        upstream: Arc<StaticProbe>,
        state: Arc<StateMachine>,
        service: FactIngestService<LogRecord>,
    }

    fn rec(n: i64, device: &str) -> LogRecord {
        LogRecord {
            id: format!("l{n}"),
            device_id: device.into(),
            date_time: Utc.timestamp_opt(1_700_000_000 + n * 60, 0).unwrap(),
            latitude: 0.0,
            longitude: 0.0,
            speed: 0.0,
        }
    }

    async fn harness(records: Vec<LogRecord>, register: bool) -> Harness {
        let tracker = MemoryServiceTracker::new();
        let now = Utc::now();
        if register {
            tracker
                .register_service(ServiceKind::LogRecordFeed, now)
                .await
                .unwrap();
        }
        tracker.register_service(ServiceKind::DeviceCache, now).await.unwrap();
        tracker.heartbeat(ServiceKind::DeviceCache, now).await.unwrap();
        tracker
            .record_processed(ServiceKind::DeviceCache, None, now)
            .await
            .unwrap();

        let upstream = Arc::new(StaticProbe::healthy("upstream"));
        let state = Arc::new(StateMachine::new(
            Arc::new(tracker.clone()),
            upstream.clone(),
        ));
        let readiness = OrchestratorReadiness::new();
        readiness.mark_initialized();
        let coordinator = Arc::new(PrerequisiteCoordinator::new(
            Arc::new(tracker.clone()),
            readiness,
            CoordinationConfig {
                prerequisite_check_interval: Duration::from_millis(10),
                ..CoordinationConfig::default()
            },
        ));
        let awaiter = Arc::new(ServiceAwaiter::new(
            ServiceKind::LogRecordFeed,
            state.clone(),
            Arc::new(ServicePauseRegistry::new()),
            coordinator,
            true,
        ));
        let source = Arc::new(ScriptedFeedSource::with_records(records));
        let store = Arc::new(MemoryFactStore::new(tracker.clone()));
        let fk_map = Arc::new(
            ForeignKeyServiceDependencyMap::new([(
                "fk_log_records_devices",
                ServiceKind::DeviceCache,
            )])
            .unwrap(),
        );
        let service = FactIngestService::new(
            ServiceKind::LogRecordFeed,
            source.clone(),
            FeedConfig {
                polling_interval_seconds: 30,
                results_limit: 100,
                start_option: FeedStartOption::FeedVersion,
                start_time: None,
            },
            store.clone(),
            Arc::new(tracker.clone()),
            awaiter,
        )
        .with_fk_map(fk_map)
        .with_prerequisites(vec![ServiceKind::DeviceCache]);
        Harness {
            tracker,
            source,
            store,
            upstream,
            state,
            service,
        }
    }

    async fn committed_version(tracker: &MemoryServiceTracker) -> Option<FeedVersion> {
        tracker
            .tracking_record(ServiceKind::LogRecordFeed)
            .await
            .unwrap()
            .and_then(|r| r.last_processed_feed_version)
    }

    #[tokio::test]
    async fn commits_filtered_batch_with_cursor() {
        let mut h = harness(vec![rec(1, "b1"), rec(2, "b2"), rec(3, "b1")], true).await;
        h.service = h.service.with_pipeline(Box::new(|| {
            EntityPipeline::new().with_stage(DeviceFilterer::from_set(FilterSet::from_config(
                &["b1".to_string()],
                false,
            )))
        }));

        let outcome = h.service.run_iteration(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::Committed {
                retrieved: 3,
                kept: 2,
                to_version: FeedVersion(3),
                full: false,
            }
        );
        assert_eq!(h.store.commits().await, vec![vec!["l1".to_string(), "l3".to_string()]]);
        assert_eq!(committed_version(&h.tracker).await, Some(FeedVersion(3)));

        // Second pass inside the polling interval is throttled.
        assert!(matches!(
            h.service.run_iteration(&CancellationToken::new()).await.unwrap(),
            IterationOutcome::Throttled { .. }
        ));
    }

    #[tokio::test]
    async fn resumes_from_committed_cursor() {
        let mut h = harness((1..=4).map(|n| rec(n, "b1")).collect(), true).await;
        h.tracker
            .rewrite_cursor(ServiceKind::LogRecordFeed, Some(FeedVersion(2)))
            .await
            .unwrap();
        h.service.run_iteration(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            h.source.requests().await,
            vec![crate::traits::FeedRequest::FromVersion(Some(FeedVersion(2)))]
        );
        assert_eq!(h.store.commits().await, vec![vec!["l3".to_string(), "l4".to_string()]]);
    }

    #[tokio::test]
    async fn foreign_key_violation_rolls_back_and_repulls() {
        let mut h = harness(vec![rec(1, "b1"), rec(2, "b1")], true).await;
        let cancel = CancellationToken::new();
        h.store
            .fail_next(ScriptedFailure::ForeignKey(Some("FK_LOG_RECORDS_DEVICES".into())));

        let err = h.service.run_iteration(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::ForeignKeyViolation { .. }));

        // The device cache makes progress shortly after the failure.
        let tracker = h.tracker.clone();
        let progress = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tracker
                .record_processed(ServiceKind::DeviceCache, None, Utc::now())
                .await
                .unwrap();
        });
        h.service.recover(err, &cancel).await.unwrap();
        progress.await.unwrap();

        assert_eq!(committed_version(&h.tracker).await, None);
        assert_eq!(h.service.puller().unwrap().last_feed_version(), None);

        h.service.run_iteration(&cancel).await.unwrap();
        assert_eq!(
            h.store.commits().await,
            vec![vec!["l1".to_string(), "l2".to_string()]]
        );
        assert_eq!(committed_version(&h.tracker).await, Some(FeedVersion(2)));
    }

    #[tokio::test]
    async fn sampled_records_survive_a_failed_persist() {
        let mut h = harness(vec![rec(1, "b1"), rec(2, "b1")], true).await;
        h.service = h.service.with_pipeline(Box::new(|| {
            EntityPipeline::new().with_stage(MinimumIntervalSampler::<LogRecord>::new(
                &SamplingConfig {
                    enabled: true,
                    min_interval_seconds: 30,
                    diagnostic_ids: vec![],
                },
            ))
        }));
        let cancel = CancellationToken::new();
        h.store
            .fail_next(ScriptedFailure::Backend("disk I/O error".into()));

        let err = h.service.run_iteration(&cancel).await.unwrap_err();
        h.service.recover(err, &cancel).await.unwrap();
        assert_eq!(committed_version(&h.tracker).await, None);

        let outcome = h.service.run_iteration(&cancel).await.unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::Committed {
                retrieved: 2,
                kept: 2,
                to_version: FeedVersion(2),
                full: false,
            }
        );
        assert_eq!(
            h.store.commits().await,
            vec![vec!["l1".to_string(), "l2".to_string()]]
        );
    }

    #[tokio::test]
    async fn other_failures_diagnose_connectivity() {
        let mut h = harness(vec![rec(1, "b1")], true).await;
        let cancel = CancellationToken::new();
        h.source
            .fail_next(ScriptedFailure::Backend("connection reset".into()));
        h.upstream.set_healthy(false);

        let err = h.service.run_iteration(&cancel).await.unwrap_err();
        h.service.recover(err, &cancel).await.unwrap();
        assert_eq!(
            h.state.waiting_reason(),
            Some(WaitReason::UpstreamUnavailable)
        );
        assert!(h.store.commits().await.is_empty());
    }

    #[tokio::test]
    async fn fatal_errors_end_the_loop() {
        let mut h = harness(vec![rec(1, "b1")], false).await;
        let err = h.service.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ServiceNotRegistered(ServiceKind::LogRecordFeed)
        ));
    }

    #[tokio::test]
    async fn cancelled_loop_returns_ok() {
        let mut h = harness(vec![], true).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        h.service.run(cancel).await.unwrap();
        assert!(h.store.commits().await.is_empty());
    }
}
