use crate::Result;
use crate::coordination::ServicePauseRegistry;
use crate::models::ServiceKind;
use crate::state::{StateMachine, WaitReason};
use crate::traits::{MaintenanceStore, ServiceTracker};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    Completed,
    /// The state was already `Waiting` for another reason.
    Skipped,
}

/// Periodically moves the process into `Waiting(DatabaseMaintenance)` and runs a store
/// maintenance pass.
pub struct DatabaseMaintenanceService {
    state: Arc<StateMachine>,
    store: Arc<dyn MaintenanceStore>,
    tracker: Arc<dyn ServiceTracker>,
    pauses: Arc<ServicePauseRegistry>,
    /// Services expected to pause before maintenance starts.
    pausing_services: Vec<ServiceKind>,
    interval: Duration,
    pub pause_grace: Duration,
}

impl DatabaseMaintenanceService {
    pub fn new(
        state: Arc<StateMachine>,
        store: Arc<dyn MaintenanceStore>,
        tracker: Arc<dyn ServiceTracker>,
        pauses: Arc<ServicePauseRegistry>,
        pausing_services: Vec<ServiceKind>,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            store,
            tracker,
            pauses,
            pausing_services,
            interval,
            pause_grace: Duration::from_secs(30),
        }
    }

    #[tracing::instrument(level = "info", skip(self, cancel))]
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<MaintenanceOutcome> {
        if !self.state.is_normal() {
            tracing::debug!(state = %self.state.current(), "skipping database maintenance");
            return Ok(MaintenanceOutcome::Skipped);
        }
        self.state.set_waiting(WaitReason::DatabaseMaintenance);
        self.wait_for_pauses(cancel).await;

        let started = Instant::now();
        let result = self.store.run_maintenance().await;
        // An outage reported by another service during the pass is kept.
        self.state.clear_waiting(WaitReason::DatabaseMaintenance);
        if let Err(e) = result {
            tracing::warn!(error = %e, "database maintenance failed");
            self.state.diagnose_outage().await;
            return Err(e);
        }

        let now = Utc::now();
        self.tracker
            .heartbeat(ServiceKind::DatabaseMaintenance, now)
            .await?;
        self.tracker
            .record_processed(ServiceKind::DatabaseMaintenance, None, now)
            .await?;
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "database maintenance completed"
        );
        Ok(MaintenanceOutcome::Completed)
    }

    /// Run on the configured interval until cancelled. Returns only fatal errors.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First maintenance happens one interval after start.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    match self.run_once(&cancel).await {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => tracing::warn!(error = %e, "maintenance pass failed"),
                    }
                }
            }
        }
    }

    /// Give pausing services a chance to reach their pause point.
    async fn wait_for_pauses(&self, cancel: &CancellationToken) {
        let deadline = Instant::now() + self.pause_grace;
        loop {
            let pending: Vec<ServiceKind> = self
                .pausing_services
                .iter()
                .copied()
                .filter(|s| !self.pauses.is_paused(*s))
                .collect();
            if pending.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    pending = ?pending,
                    "starting maintenance before every service paused"
                );
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }
}
