use crate::config::CoordinationConfig;
use crate::models::{ServiceKind, ServiceTrackingRecord};
use crate::traits::ServiceTracker;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Set once by the orchestrator after registration and validation succeed.
///
/// Cloned into every dependent service at construction.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorReadiness {
    initialized: Arc<AtomicBool>,
}

impl OrchestratorReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

/// Result of checking a set of prerequisites once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrerequisiteStatus {
    pub orchestrator_ready: bool,
    /// No record, or no heartbeat within the timeout.
    pub not_running: Vec<ServiceKind>,
    /// Running, but no data processed since the service last started.
    pub idle: Vec<ServiceKind>,
}

impl PrerequisiteStatus {
    pub fn is_satisfied(&self) -> bool {
        self.orchestrator_ready && self.not_running.is_empty() && self.idle.is_empty()
    }
}

/// Classify `prerequisites` against the tracking records.
pub fn evaluate_prerequisites(
    records: &[ServiceTrackingRecord],
    prerequisites: &[ServiceKind],
    require_data: bool,
    orchestrator_ready: bool,
    now: DateTime<Utc>,
    heartbeat_timeout: chrono::Duration,
) -> PrerequisiteStatus {
    let mut status = PrerequisiteStatus {
        orchestrator_ready,
        ..Default::default()
    };
    for service in prerequisites {
        let Some(record) = records.iter().find(|r| r.service == *service) else {
            status.not_running.push(*service);
            continue;
        };
        if !record.is_running(now, heartbeat_timeout) {
            status.not_running.push(*service);
        } else if require_data && !record.has_processed_since_start() {
            status.idle.push(*service);
        }
    }
    status
}

/// Blocks dependent services until the orchestrator and their prerequisite services are up.
pub struct PrerequisiteCoordinator {
    tracker: Arc<dyn ServiceTracker>,
    readiness: OrchestratorReadiness,
    config: CoordinationConfig,
}

impl PrerequisiteCoordinator {
    pub fn new(
        tracker: Arc<dyn ServiceTracker>,
        readiness: OrchestratorReadiness,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            tracker,
            readiness,
            config,
        }
    }

    pub fn readiness(&self) -> &OrchestratorReadiness {
        &self.readiness
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn check(
        &self,
        prerequisites: &[ServiceKind],
        require_data: bool,
    ) -> Result<PrerequisiteStatus> {
        let orchestrator_ready = self.readiness.is_initialized();
        // Records are only meaningful once the orchestrator has registered every service.
        if !orchestrator_ready {
            return Ok(PrerequisiteStatus {
                orchestrator_ready,
                ..Default::default()
            });
        }
        let records = self.tracker.tracking_records().await?;
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .map_err(|e| Error::InvalidInput(format!("heartbeat timeout out of range: {e}")))?;
        Ok(evaluate_prerequisites(
            &records,
            prerequisites,
            require_data,
            orchestrator_ready,
            Utc::now(),
            timeout,
        ))
    }

    /// Poll until every prerequisite is satisfied. Returns immediately when they already are.
    ///
    /// Tracker errors propagate so the caller can diagnose connectivity.
    #[tracing::instrument(level = "debug", skip(self, cancel), fields(service = %dependent))]
    pub async fn wait_for_prerequisites_if_needed(
        &self,
        dependent: ServiceKind,
        prerequisites: &[ServiceKind],
        require_data: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut last_logged: Option<Instant> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let status = self.check(prerequisites, require_data).await?;
            if status.is_satisfied() {
                if last_logged.is_some() {
                    tracing::info!(service = %dependent, "prerequisites satisfied; resuming");
                }
                return Ok(());
            }

            let due = last_logged
                .map(|at| at.elapsed() >= self.config.prerequisite_log_interval)
                .unwrap_or(true);
            if due {
                tracing::info!(
                    service = %dependent,
                    orchestrator_ready = status.orchestrator_ready,
                    not_running = ?status.not_running,
                    idle = ?status.idle,
                    next_check_in_ms = self.config.prerequisite_check_interval.as_millis() as u64,
                    "waiting for prerequisite services"
                );
                last_logged = Some(Instant::now());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.prerequisite_check_interval) => {}
            }
        }
    }

    /// Wait until `prerequisite` has processed data after `since`.
    ///
    /// Used after a write was rejected for a missing parent row: the parent's service must
    /// make progress before the batch is worth retrying.
    #[tracing::instrument(level = "debug", skip(self, cancel), fields(service = %dependent))]
    pub async fn wait_for_progress_since(
        &self,
        dependent: ServiceKind,
        prerequisite: ServiceKind,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut last_logged: Option<Instant> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let progressed = self
                .tracker
                .tracking_record(prerequisite)
                .await?
                .and_then(|r| r.entities_last_processed_at)
                .is_some_and(|at| at > since);
            if progressed {
                return Ok(());
            }
            let due = last_logged
                .map(|at| at.elapsed() >= self.config.prerequisite_log_interval)
                .unwrap_or(true);
            if due {
                tracing::info!(
                    service = %dependent,
                    prerequisite = %prerequisite,
                    since = %since,
                    "waiting for prerequisite to process new data"
                );
                last_logged = Some(Instant::now());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.prerequisite_check_interval) => {}
            }
        }
    }
}
