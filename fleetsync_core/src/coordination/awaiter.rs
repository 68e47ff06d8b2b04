use crate::Result;
use crate::coordination::prerequisites::PrerequisiteCoordinator;
use crate::models::ServiceKind;
use crate::state::{ConnectivityState, StateMachine, WaitReason};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const MAX_SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Which services are currently paused, and since when.
#[derive(Debug, Default)]
pub struct ServicePauseRegistry {
    paused: DashMap<ServiceKind, DateTime<Utc>>,
}

impl ServicePauseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `service` paused until the returned guard is dropped.
    pub fn pause(&self, service: ServiceKind) -> PauseGuard<'_> {
        self.paused.insert(service, Utc::now());
        PauseGuard {
            registry: self,
            service,
        }
    }

    pub fn is_paused(&self, service: ServiceKind) -> bool {
        self.paused.contains_key(&service)
    }

    pub fn paused_since(&self, service: ServiceKind) -> Option<DateTime<Utc>> {
        self.paused.get(&service).map(|e| *e.value())
    }

    pub fn paused_services(&self) -> Vec<ServiceKind> {
        let mut out: Vec<ServiceKind> = self.paused.iter().map(|e| *e.key()).collect();
        out.sort();
        out
    }
}

pub struct PauseGuard<'a> {
    registry: &'a ServicePauseRegistry,
    service: ServiceKind,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.registry.paused.remove(&self.service);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IntervalWaitOutcome {
    Elapsed,
    StateChanged,
    Cancelled,
}

/// Per-service view of the shared coordination primitives.
pub struct ServiceAwaiter {
    service: ServiceKind,
    state: Arc<StateMachine>,
    pauses: Arc<ServicePauseRegistry>,
    coordinator: Arc<PrerequisiteCoordinator>,
    pause_for_maintenance: bool,
    pub connectivity_poll_interval: Duration,
    pub maintenance_poll_interval: Duration,
}

impl ServiceAwaiter {
    pub fn new(
        service: ServiceKind,
        state: Arc<StateMachine>,
        pauses: Arc<ServicePauseRegistry>,
        coordinator: Arc<PrerequisiteCoordinator>,
        pause_for_maintenance: bool,
    ) -> Self {
        Self {
            service,
            state,
            pauses,
            coordinator,
            pause_for_maintenance,
            connectivity_poll_interval: Duration::from_millis(500),
            maintenance_poll_interval: Duration::from_secs(5),
        }
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    /// Sleep for `delay` in short slices.
    ///
    /// Ends early on cancellation, or when the state moves to a `Waiting` state other than the
    /// one observed on entry. A service that keeps running through a `Waiting` state it does not
    /// pause for would otherwise never sleep.
    pub async fn wait_for_configured_interval(
        &self,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> IntervalWaitOutcome {
        let entered_with = self.state.current();
        let deadline = Instant::now() + delay;
        loop {
            if cancel.is_cancelled() {
                return IntervalWaitOutcome::Cancelled;
            }
            let current = self.state.current();
            if matches!(current, ConnectivityState::Waiting(_)) && current != entered_with {
                tracing::debug!(
                    service = %self.service,
                    state = %current,
                    "interval wait interrupted"
                );
                return IntervalWaitOutcome::StateChanged;
            }
            let now = Instant::now();
            if now >= deadline {
                return IntervalWaitOutcome::Elapsed;
            }
            let slice = (deadline - now).min(MAX_SLEEP_SLICE);
            tokio::select! {
                _ = cancel.cancelled() => return IntervalWaitOutcome::Cancelled,
                _ = tokio::time::sleep(slice) => {}
            }
        }
    }

    /// While the database or upstream is unreachable, pause and poll until it comes back.
    ///
    /// Returns true when the service had to wait.
    #[tracing::instrument(level = "debug", skip(self, cancel), fields(service = %self.service))]
    pub async fn wait_for_connectivity_restoration_if_needed(
        &self,
        cancel: &CancellationToken,
    ) -> bool {
        self.pause_while(
            |reason| reason.is_connectivity(),
            self.connectivity_poll_interval,
            "connectivity",
            cancel,
        )
        .await
    }

    /// While database maintenance runs, pause if this service is configured to.
    #[tracing::instrument(level = "debug", skip(self, cancel), fields(service = %self.service))]
    pub async fn wait_for_database_maintenance_completion_if_needed(
        &self,
        cancel: &CancellationToken,
    ) -> bool {
        if !self.pause_for_maintenance {
            return false;
        }
        self.pause_while(
            |reason| reason == WaitReason::DatabaseMaintenance,
            self.maintenance_poll_interval,
            "database maintenance",
            cancel,
        )
        .await
    }

    pub async fn wait_for_prerequisites_if_needed(
        &self,
        prerequisites: &[ServiceKind],
        require_data: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.coordinator
            .wait_for_prerequisites_if_needed(self.service, prerequisites, require_data, cancel)
            .await
    }

    pub async fn wait_for_prerequisite_progress(
        &self,
        prerequisite: ServiceKind,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.coordinator
            .wait_for_progress_since(self.service, prerequisite, since, cancel)
            .await
    }

    async fn pause_while(
        &self,
        applies: impl Fn(WaitReason) -> bool,
        poll: Duration,
        label: &'static str,
        cancel: &CancellationToken,
    ) -> bool {
        let holds = |state: &StateMachine| state.waiting_reason().is_some_and(&applies);
        if !holds(self.state.as_ref()) {
            return false;
        }

        let _pause = self.pauses.pause(self.service);
        let started = Instant::now();
        tracing::info!(
            service = %self.service,
            state = %self.state.current(),
            "pausing for {label}"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(service = %self.service, "cancelled while paused for {label}");
                    return true;
                }
                _ = tokio::time::sleep(poll) => {}
            }
            if !holds(self.state.as_ref()) {
                break;
            }
        }
        tracing::info!(
            service = %self.service,
            paused_ms = started.elapsed().as_millis() as u64,
            "resuming after {label}"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use crate::coordination::prerequisites::OrchestratorReadiness;
    use crate::memory::{MemoryServiceTracker, StaticProbe};

    type Fixture = (
        Arc<ServiceAwaiter>,
        Arc<StateMachine>,
        Arc<ServicePauseRegistry>,
    );

    fn awaiter(pause_for_maintenance: bool) -> Fixture {
        let state = Arc::new(StateMachine::new(
            Arc::new(StaticProbe::healthy("database")),
            Arc::new(StaticProbe::healthy("upstream")),
        ));
        let pauses = Arc::new(ServicePauseRegistry::new());
        let coordinator = Arc::new(PrerequisiteCoordinator::new(
            Arc::new(MemoryServiceTracker::new()),
            OrchestratorReadiness::new(),
            CoordinationConfig::default(),
        ));
        let awaiter = Arc::new(ServiceAwaiter::new(
            ServiceKind::LogRecordFeed,
            state.clone(),
            pauses.clone(),
            coordinator,
            pause_for_maintenance,
        ));
        (awaiter, state, pauses)
    }

    #[tokio::test(start_paused = true)]
    async fn interval_elapses_when_nothing_happens() {
        let (awaiter, _, _) = awaiter(true);
        let start = Instant::now();
        let outcome = awaiter
            .wait_for_configured_interval(Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(outcome, IntervalWaitOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ends_early_on_waiting() {
        let (awaiter, state, _) = awaiter(true);
        let task = {
            let awaiter = awaiter.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let cancel = CancellationToken::new();
                let outcome = awaiter
                    .wait_for_configured_interval(Duration::from_secs(60), &cancel)
                    .await;
                (outcome, start.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_millis(2500)).await;
        state.set_waiting(WaitReason::UpstreamUnavailable);
        let (outcome, elapsed) = task.await.unwrap();
        assert_eq!(outcome, IntervalWaitOutcome::StateChanged);
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ends_early_on_cancel() {
        let (awaiter, _, _) = awaiter(true);
        let cancel = CancellationToken::new();
        let task = {
            let awaiter = awaiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                awaiter
                    .wait_for_configured_interval(Duration::from_secs(60), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), IntervalWaitOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_wait_registers_pause_until_restored() {
        let (awaiter, state, pauses) = awaiter(true);
        assert!(
            !awaiter
                .wait_for_connectivity_restoration_if_needed(&CancellationToken::new())
                .await
        );

        state.set_waiting(WaitReason::DatabaseUnavailable);
        let task = {
            let awaiter = awaiter.clone();
            tokio::spawn(async move {
                awaiter
                    .wait_for_connectivity_restoration_if_needed(&CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pauses.is_paused(ServiceKind::LogRecordFeed));

        state.set_normal();
        assert!(task.await.unwrap());
        assert!(!pauses.is_paused(ServiceKind::LogRecordFeed));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_is_cleared_after_cancelled_wait() {
        let (awaiter, state, pauses) = awaiter(true);
        state.set_waiting(WaitReason::DatabaseMaintenance);
        let cancel = CancellationToken::new();
        let task = {
            let awaiter = awaiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                awaiter
                    .wait_for_database_maintenance_completion_if_needed(&cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(pauses.paused_services(), vec![ServiceKind::LogRecordFeed]);

        cancel.cancel();
        assert!(task.await.unwrap());
        assert!(pauses.paused_services().is_empty());
        assert_eq!(state.waiting_reason(), Some(WaitReason::DatabaseMaintenance));
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_is_ignored_without_pause_flag() {
        let (awaiter, state, pauses) = awaiter(false);
        state.set_waiting(WaitReason::DatabaseMaintenance);
        assert!(
            !awaiter
                .wait_for_database_maintenance_completion_if_needed(&CancellationToken::new())
                .await
        );
        assert!(!pauses.is_paused(ServiceKind::LogRecordFeed));
        // Connectivity waits do not apply to maintenance either.
        assert!(
            !awaiter
                .wait_for_connectivity_restoration_if_needed(&CancellationToken::new())
                .await
        );
    }
}
