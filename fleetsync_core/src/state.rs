//! Connectivity / maintenance state shared by every ingestion service.
//!
//! The state is level-triggered: once a service observes `Waiting` it stays paused until a
//! driver re-probes and sets `Normal` again. There are no intermediate states.

use crate::traits::LivenessProbe;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    ApplicationNotInitialized,
    DatabaseMaintenance,
    DatabaseUnavailable,
    UpstreamUnavailable,
}

impl WaitReason {
    /// Reasons cleared by re-probing a dependency.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            WaitReason::DatabaseUnavailable | WaitReason::UpstreamUnavailable
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Normal,
    Waiting,
}

/// Flat view of the reason, `NoReason` exactly when the state is `Normal`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateReason {
    NoReason,
    ApplicationNotInitialized,
    DatabaseMaintenance,
    DatabaseUnavailable,
    UpstreamUnavailable,
}

impl From<WaitReason> for StateReason {
    fn from(value: WaitReason) -> Self {
        match value {
            WaitReason::ApplicationNotInitialized => StateReason::ApplicationNotInitialized,
            WaitReason::DatabaseMaintenance => StateReason::DatabaseMaintenance,
            WaitReason::DatabaseUnavailable => StateReason::DatabaseUnavailable,
            WaitReason::UpstreamUnavailable => StateReason::UpstreamUnavailable,
        }
    }
}

impl StateReason {
    fn wait_reason(self) -> Option<WaitReason> {
        match self {
            StateReason::NoReason => None,
            StateReason::ApplicationNotInitialized => Some(WaitReason::ApplicationNotInitialized),
            StateReason::DatabaseMaintenance => Some(WaitReason::DatabaseMaintenance),
            StateReason::DatabaseUnavailable => Some(WaitReason::DatabaseUnavailable),
            StateReason::UpstreamUnavailable => Some(WaitReason::UpstreamUnavailable),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ConnectivityState {
    Normal,
    Waiting(WaitReason),
}

impl ConnectivityState {
    pub fn kind(&self) -> StateKind {
        match self {
            ConnectivityState::Normal => StateKind::Normal,
            ConnectivityState::Waiting(_) => StateKind::Waiting,
        }
    }

    pub fn reason(&self) -> StateReason {
        match self {
            ConnectivityState::Normal => StateReason::NoReason,
            ConnectivityState::Waiting(r) => (*r).into(),
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Normal => f.write_str("normal"),
            ConnectivityState::Waiting(r) => write!(f, "waiting ({r:?})"),
        }
    }
}

/// Process-wide connectivity state plus the probes used to classify outages.
pub struct StateMachine {
    state: watch::Sender<ConnectivityState>,
    database: Arc<dyn LivenessProbe>,
    upstream: Arc<dyn LivenessProbe>,
}

impl StateMachine {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(database: Arc<dyn LivenessProbe>, upstream: Arc<dyn LivenessProbe>) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Normal);
        Self {
            state,
            database,
            upstream,
        }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_normal(&self) -> bool {
        self.current() == ConnectivityState::Normal
    }

    pub fn waiting_reason(&self) -> Option<WaitReason> {
        match self.current() {
            ConnectivityState::Normal => None,
            ConnectivityState::Waiting(r) => Some(r),
        }
    }

    /// Set the state from its flat representation.
    ///
    /// `Normal` always carries `NoReason`, whatever reason is passed. `Waiting` requires a
    /// real reason.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_state(&self, kind: StateKind, reason: StateReason) -> Result<()> {
        match kind {
            StateKind::Normal => self.set_normal(),
            StateKind::Waiting => {
                let reason = reason.wait_reason().ok_or_else(|| {
                    Error::InvalidInput("waiting state requires a reason".to_string())
                })?;
                self.set_waiting(reason);
            }
        }
        Ok(())
    }

    pub fn set_normal(&self) {
        let previous = self.state.send_replace(ConnectivityState::Normal);
        if previous != ConnectivityState::Normal {
            tracing::info!(previous = %previous, "connectivity state restored to normal");
        }
    }

    pub fn set_waiting(&self, reason: WaitReason) {
        let next = ConnectivityState::Waiting(reason);
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(
                previous = %previous,
                reason = ?reason,
                "connectivity state changed to waiting"
            );
        }
    }

    /// Return to `Normal` only if still waiting for `reason`. Returns whether the state changed.
    pub fn clear_waiting(&self, reason: WaitReason) -> bool {
        let cleared = self.state.send_if_modified(|state| {
            if *state == ConnectivityState::Waiting(reason) {
                *state = ConnectivityState::Normal;
                true
            } else {
                false
            }
        });
        if cleared {
            tracing::info!(previous = ?reason, "connectivity state restored to normal");
        }
        cleared
    }

    /// Observe state transitions (e.g. for health endpoints).
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// One trivial read against the store. Any failure means inaccessible.
    pub async fn is_database_accessible(&self) -> bool {
        probe_ok(self.database.as_ref()).await
    }

    /// One trivial metadata call against the upstream API. Any failure means inaccessible.
    pub async fn is_upstream_accessible(&self) -> bool {
        probe_ok(self.upstream.as_ref()).await
    }

    /// Probe both dependencies after a failure and move to `Waiting` if either is down.
    ///
    /// Returns true when an outage was detected.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn diagnose_outage(&self) -> bool {
        if !self.is_upstream_accessible().await {
            self.set_waiting(WaitReason::UpstreamUnavailable);
            return true;
        }
        if !self.is_database_accessible().await {
            self.set_waiting(WaitReason::DatabaseUnavailable);
            return true;
        }
        false
    }

    /// If waiting on a connectivity outage, re-probe and return to `Normal` when both
    /// dependencies answer. Returns true when the state was restored.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn try_restore_connectivity(&self) -> bool {
        let Some(reason) = self.waiting_reason() else {
            return false;
        };
        if !reason.is_connectivity() {
            return false;
        }
        if !self.is_upstream_accessible().await {
            self.set_waiting(WaitReason::UpstreamUnavailable);
            return false;
        }
        if !self.is_database_accessible().await {
            self.set_waiting(WaitReason::DatabaseUnavailable);
            return false;
        }
        self.set_normal();
        true
    }
}

async fn probe_ok(probe: &dyn LivenessProbe) -> bool {
    match probe.probe().await {
        Ok(()) => true,
        Err(e) => {
            // Cause is deliberately not classified; timeouts, auth and bad payloads all
            // collapse into "inaccessible".
            tracing::debug!(probe = probe.name(), error = %e, "liveness probe failed");
            false
        }
    }
}

/// Background task that re-probes dependencies while the state machine waits on an outage.
pub struct ConnectivityMonitor {
    state: Arc<StateMachine>,
    pub check_interval: Duration,
}

impl ConnectivityMonitor {
    pub fn new(state: Arc<StateMachine>) -> Self {
        Self {
            state,
            check_interval: Duration::from_secs(5),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("connectivity monitor cancelled");
                    return;
                }
                _ = interval.tick() => {
                    if self.state.try_restore_connectivity().await {
                        tracing::info!("connectivity restored");
                    }
                }
            }
        }
    }
}
