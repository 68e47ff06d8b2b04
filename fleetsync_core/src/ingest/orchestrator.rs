use crate::coordination::OrchestratorReadiness;
use crate::environment::{EnvironmentIdentity, EnvironmentValidator};
use crate::models::ServiceKind;
use crate::state::{StateMachine, WaitReason};
use crate::traits::ServiceTracker;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Registers services, validates the environment and releases dependents.
///
/// Every process runs one, whatever it hosts. Only the process hosting
/// `ServiceKind::Orchestrator` registers and heartbeats that record, so machines sharing a
/// database can split the services between them.
pub struct Orchestrator {
    identity: Arc<EnvironmentIdentity>,
    tracker: Arc<dyn ServiceTracker>,
    state: Arc<StateMachine>,
    readiness: OrchestratorReadiness,
    /// Services hosted by this process.
    services: Vec<ServiceKind>,
    disable_machine_name_validation: bool,
    pub database_poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        identity: Arc<EnvironmentIdentity>,
        tracker: Arc<dyn ServiceTracker>,
        state: Arc<StateMachine>,
        readiness: OrchestratorReadiness,
        services: impl IntoIterator<Item = ServiceKind>,
        disable_machine_name_validation: bool,
    ) -> Self {
        let mut services: Vec<ServiceKind> = services.into_iter().collect();
        services.sort();
        services.dedup();
        Self {
            identity,
            tracker,
            state,
            readiness,
            services,
            disable_machine_name_validation,
            database_poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(60),
        }
    }

    pub fn services(&self) -> &[ServiceKind] {
        &self.services
    }

    fn hosts_orchestrator_record(&self) -> bool {
        self.services.contains(&ServiceKind::Orchestrator)
    }

    /// Wait for the database, register, validate and stamp every hosted service, then mark
    /// the application ready.
    ///
    /// Validation failures are fatal and returned as-is.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(instance_id = %self.identity.instance_id)
    )]
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        self.wait_for_database(cancel).await?;

        let started_at = Utc::now();
        for service in &self.services {
            self.tracker.register_service(*service, started_at).await?;
        }
        tracing::info!(services = ?self.services, "services registered");

        for service in &self.services {
            EnvironmentValidator::new(
                self.identity.clone(),
                self.tracker.clone(),
                *service,
                self.disable_machine_name_validation,
            )
            .validate_and_stamp()
            .await?;
        }

        self.readiness.mark_initialized();
        self.state
            .clear_waiting(WaitReason::ApplicationNotInitialized);
        if self.hosts_orchestrator_record() {
            self.tracker
                .heartbeat(ServiceKind::Orchestrator, Utc::now())
                .await?;
        }
        tracing::info!(
            version = %self.identity.version,
            machine = %self.identity.machine_name,
            "orchestrator initialized"
        );
        Ok(())
    }

    /// Heartbeat the orchestrator record until cancelled.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if !self.hosts_orchestrator_record() {
            cancel.cancelled().await;
            return Ok(());
        }
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let beat = self.tracker.heartbeat(ServiceKind::Orchestrator, Utc::now()).await;
                    if let Err(e) = beat {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        tracing::warn!(error = %e, "orchestrator heartbeat failed");
                        self.state.diagnose_outage().await;
                    }
                }
            }
        }
    }

    async fn wait_for_database(&self, cancel: &CancellationToken) -> Result<()> {
        let mut logged = false;
        loop {
            if self.state.is_database_accessible().await {
                return Ok(());
            }
            if !logged {
                tracing::warn!("database is not accessible; waiting before initialization");
                logged = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.database_poll_interval) => {}
            }
        }
    }
}
