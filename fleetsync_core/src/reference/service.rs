use crate::coordination::{IntervalWaitOutcome, ServiceAwaiter};
use crate::entities::ReferenceEntity;
use crate::reference::cacher::{ReferenceObjectCacher, UpdateOutcome};
use crate::traits::{ReferenceStore, ServiceTracker};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Keeps one reference cache current and mirrors its changes into the store.
pub struct ReferenceCacheService<T> {
    cacher: Arc<ReferenceObjectCacher<T>>,
    store: Arc<dyn ReferenceStore<T>>,
    tracker: Arc<dyn ServiceTracker>,
    awaiter: Arc<ServiceAwaiter>,
    pub tick_interval: Duration,
}

impl<T> ReferenceCacheService<T>
where
    T: ReferenceEntity + PartialEq,
{
    pub fn new(
        cacher: Arc<ReferenceObjectCacher<T>>,
        store: Arc<dyn ReferenceStore<T>>,
        tracker: Arc<dyn ServiceTracker>,
        awaiter: Arc<ServiceAwaiter>,
    ) -> Self {
        Self {
            cacher,
            store,
            tracker,
            awaiter,
            tick_interval: Duration::from_secs(30),
        }
    }

    pub fn cacher(&self) -> &Arc<ReferenceObjectCacher<T>> {
        &self.cacher
    }

    /// One pass: heartbeat, update the cache if due, propagate the delta.
    #[tracing::instrument(level = "debug", skip(self), fields(service = %self.cacher.service()))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<UpdateOutcome> {
        let service = self.cacher.service();
        self.tracker.heartbeat(service, now).await?;

        let outcome = self.cacher.update_if_required(now).await?;

        let changes = self.cacher.take_changes_for_propagation(now).await;
        let propagated = !changes.is_empty();
        if propagated {
            match self.store.upsert(&changes, now).await {
                Ok(count) => {
                    tracing::info!(
                        service = %service,
                        entity_type = %T::ENTITY_TYPE,
                        count,
                        "propagated reference changes"
                    );
                }
                Err(e) => {
                    self.cacher.requeue_changes(changes).await;
                    return Err(e);
                }
            }
        }

        if outcome.did_work() || propagated {
            self.tracker
                .record_processed(service, self.cacher.last_feed_version(), now)
                .await?;
        }
        Ok(outcome)
    }

    /// Run until cancelled. Returns only fatal errors.
    #[tracing::instrument(level = "info", skip_all, fields(service = %self.cacher.service()))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.awaiter
                .wait_for_connectivity_restoration_if_needed(&cancel)
                .await;
            self.awaiter
                .wait_for_database_maintenance_completion_if_needed(&cancel)
                .await;

            let pass = match self
                .awaiter
                .wait_for_prerequisites_if_needed(&[], false, &cancel)
                .await
            {
                Ok(()) => self.run_once(Utc::now()).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match pass {
                Ok(()) => {}
                Err(Error::Cancelled) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        service = %self.cacher.service(),
                        error = %e,
                        "reference cache pass failed"
                    );
                    self.awaiter.state().diagnose_outage().await;
                }
            }

            if self
                .awaiter
                .wait_for_configured_interval(self.tick_interval, &cancel)
                .await
                == IntervalWaitOutcome::Cancelled
            {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinationConfig, ReferenceCacheConfig};
    use crate::coordination::{OrchestratorReadiness, PrerequisiteCoordinator, ServicePauseRegistry};
    use crate::entities::Diagnostic;
    use crate::memory::{
        MemoryReferenceStore, MemoryServiceTracker, ScriptedFailure, StaticProbe,
        StaticReferenceSource,
    };
    use crate::models::ServiceKind;
    use crate::state::StateMachine;

    fn diagnostic(id: &str) -> Diagnostic {
        Diagnostic {
            id: id.into(),
            name: format!("diag {id}"),
            code: None,
            unit_of_measure: None,
            source: None,
        }
    }

    async fn service(
        tracker: &MemoryServiceTracker,
        store: Arc<MemoryReferenceStore<Diagnostic>>,
    ) -> ReferenceCacheService<Diagnostic> {
        tracker
            .register_service(ServiceKind::DiagnosticCache, Utc::now())
            .await
            .unwrap();
        let source = Arc::new(StaticReferenceSource::new(vec![diagnostic("g1"), diagnostic("g2")]));
        let cacher = Arc::new(ReferenceObjectCacher::new(
            ServiceKind::DiagnosticCache,
            source,
            ReferenceCacheConfig::default(),
        ));
        let tracker: Arc<dyn ServiceTracker> = Arc::new(tracker.clone());
        let state = Arc::new(StateMachine::new(
            Arc::new(StaticProbe::healthy("database")),
            Arc::new(StaticProbe::healthy("upstream")),
        ));
        let coordinator = Arc::new(PrerequisiteCoordinator::new(
            tracker.clone(),
            OrchestratorReadiness::new(),
            CoordinationConfig::default(),
        ));
        let awaiter = Arc::new(ServiceAwaiter::new(
            ServiceKind::DiagnosticCache,
            state,
            Arc::new(ServicePauseRegistry::new()),
            coordinator,
            false,
        ));
        ReferenceCacheService::new(cacher, store, tracker, awaiter)
    }

    #[tokio::test]
    async fn first_pass_refreshes_and_marks_processed() {
        let tracker = MemoryServiceTracker::new();
        let store = Arc::new(MemoryReferenceStore::new());
        let svc = service(&tracker, store.clone()).await;

        let outcome = svc.run_once(Utc::now()).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Refreshed { count: 2 });
        assert_eq!(store.items().await.len(), 2);

        let record = tracker
            .tracking_record(ServiceKind::DiagnosticCache)
            .await
            .unwrap()
            .unwrap();
        assert!(record.has_processed_since_start());
        assert!(record.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn failed_upsert_is_retried_next_pass() {
        let tracker = MemoryServiceTracker::new();
        let store = Arc::new(MemoryReferenceStore::new());
        let svc = service(&tracker, store.clone()).await;

        let now = Utc::now();
        store.fail_next(ScriptedFailure::Backend("disk full".into()));
        assert!(svc.run_once(now).await.is_err());
        assert!(store.items().await.is_empty());

        // Nothing new is due, but the requeued delta still goes out.
        let outcome = svc.run_once(now).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::NotRequired);
        assert!(store.contains("g1").await);
        assert!(store.contains("g2").await);
    }
}
