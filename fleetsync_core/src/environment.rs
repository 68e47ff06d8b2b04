//! Fail-fast checks that keep several machines from corrupting one shared database.
//!
//! There is no distributed lock. Every service compares this process's identity against
//! the tracking records written by all other instances and refuses to run when it would
//! downgrade data or duplicate another machine's writes. Two instances started at the same
//! moment can both pass before either stamps its identity; that window is accepted.

use crate::models::{ServiceKind, ServiceTrackingRecord};
use crate::traits::ServiceTracker;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Dotted numeric version with one to four components. Missing components compare as zero.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AdapterVersion {
    parts: [u32; 4],
    len: u8,
}

impl AdapterVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            parts: [major, minor, patch, 0],
            len: 3,
        }
    }

    pub fn components(&self) -> &[u32] {
        &self.parts[..self.len as usize]
    }
}

impl PartialEq for AdapterVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for AdapterVersion {}

impl Hash for AdapterVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts.hash(state);
    }
}

impl PartialOrd for AdapterVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AdapterVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl fmt::Display for AdapterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for p in self.components() {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{p}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for AdapterVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut parts = [0u32; 4];
        let mut len = 0usize;
        for token in s.split('.') {
            if len == 4 {
                return Err(Error::InvalidInput(format!(
                    "version '{s}' has more than 4 components"
                )));
            }
            parts[len] = token
                .parse::<u32>()
                .map_err(|_| Error::InvalidInput(format!("invalid version '{s}'")))?;
            len += 1;
        }
        Ok(Self {
            parts,
            len: len as u8,
        })
    }
}

impl TryFrom<String> for AdapterVersion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AdapterVersion> for String {
    fn from(value: AdapterVersion) -> Self {
        value.to_string()
    }
}

/// Who this process is. Computed once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentIdentity {
    pub assembly_name: String,
    pub machine_name: String,
    pub version: AdapterVersion,
    pub instance_id: Uuid,
}

impl EnvironmentIdentity {
    pub fn new(
        assembly_name: impl Into<String>,
        machine_name: impl Into<String>,
        version: AdapterVersion,
    ) -> Self {
        Self {
            assembly_name: assembly_name.into(),
            machine_name: machine_name.into(),
            version,
            instance_id: Uuid::new_v4(),
        }
    }

    #[tracing::instrument(level = "debug")]
    pub fn detect() -> Result<Self> {
        let machine_name = hostname::get()
            .map_err(|e| Error::backend("resolve hostname", e))?
            .to_string_lossy()
            .into_owned();
        if machine_name.trim().is_empty() {
            return Err(Error::InvalidInput("hostname is empty".to_string()));
        }
        let version: AdapterVersion = env!("CARGO_PKG_VERSION").parse()?;
        Ok(Self::new(env!("CARGO_PKG_NAME"), machine_name, version))
    }
}

fn own_record<'a>(
    records: &'a [ServiceTrackingRecord],
    service: ServiceKind,
) -> Result<&'a ServiceTrackingRecord> {
    records
        .iter()
        .find(|r| r.service == service)
        .ok_or(Error::ServiceNotRegistered(service))
}

/// Refuse to run when any instance of any service logged a newer adapter version.
#[tracing::instrument(level = "debug", skip(identity, records))]
pub fn validate_version(
    identity: &EnvironmentIdentity,
    records: &[ServiceTrackingRecord],
    service: ServiceKind,
) -> Result<()> {
    let own = own_record(records, service)?;
    match own.adapter_version {
        Some(logged) if logged > identity.version => {
            return Err(Error::VersionDowngrade {
                service,
                logged,
                running: identity.version,
            });
        }
        Some(_) => {}
        None => {
            tracing::debug!(%service, "no adapter version logged yet; first run for this service");
        }
    }

    for rec in records {
        if let Some(logged) = rec.adapter_version {
            if logged > identity.version {
                return Err(Error::VersionDowngrade {
                    service: rec.service,
                    logged,
                    running: identity.version,
                });
            }
        }
    }
    Ok(())
}

/// Refuse to run a service that is already tracked on a different machine.
///
/// `disable_check` is a safety override for hosts whose names are not stable (some container
/// platforms). With it set, nothing prevents two hosts from writing the same data.
#[tracing::instrument(level = "debug", skip(identity, records))]
pub fn validate_machine_name(
    identity: &EnvironmentIdentity,
    records: &[ServiceTrackingRecord],
    service: ServiceKind,
    disable_check: bool,
) -> Result<()> {
    let own = own_record(records, service)?;
    let Some(logged) = own.adapter_machine_name.as_deref() else {
        return Ok(());
    };
    if logged == identity.machine_name {
        return Ok(());
    }
    if disable_check {
        tracing::warn!(
            %service,
            logged_machine = logged,
            machine = %identity.machine_name,
            "machine name validation disabled; continuing although the service is tracked on another machine"
        );
        return Ok(());
    }
    Err(Error::MachineNameMismatch {
        service,
        logged: logged.to_string(),
        running: identity.machine_name.clone(),
    })
}

/// Runs both environment checks for one service against the persisted tracking records.
pub struct EnvironmentValidator {
    identity: Arc<EnvironmentIdentity>,
    tracker: Arc<dyn ServiceTracker>,
    service: ServiceKind,
    disable_machine_name_check: bool,
}

impl EnvironmentValidator {
    pub fn new(
        identity: Arc<EnvironmentIdentity>,
        tracker: Arc<dyn ServiceTracker>,
        service: ServiceKind,
        disable_machine_name_check: bool,
    ) -> Self {
        Self {
            identity,
            tracker,
            service,
            disable_machine_name_check,
        }
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    #[tracing::instrument(level = "debug", skip(self), fields(service = %self.service))]
    pub async fn validate(&self) -> Result<()> {
        let records = self.tracker.tracking_records().await?;
        validate_version(&self.identity, &records, self.service)?;
        validate_machine_name(
            &self.identity,
            &records,
            self.service,
            self.disable_machine_name_check,
        )?;
        Ok(())
    }

    /// Validate, then claim the service for this instance's version and machine.
    #[tracing::instrument(level = "info", skip(self), fields(service = %self.service))]
    pub async fn validate_and_stamp(&self) -> Result<()> {
        self.validate().await?;
        self.tracker
            .stamp_identity(
                self.service,
                &self.identity.version,
                &self.identity.machine_name,
            )
            .await?;
        tracing::info!(
            version = %self.identity.version,
            machine = %self.identity.machine_name,
            instance_id = %self.identity.instance_id,
            "environment validated"
        );
        Ok(())
    }

    /// Re-validate on an interval. Returns the first fatal error, or `Ok` when cancelled.
    ///
    /// Non-fatal errors (e.g. the database is briefly unreachable) are logged and retried on
    /// the next tick.
    #[tracing::instrument(level = "info", skip(self, cancel), fields(service = %self.service))]
    pub async fn run_periodic(&self, interval: Duration, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    match self.validate().await {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            tracing::warn!(error = %e, "periodic environment validation failed")
                        }
                    }
                }
            }
        }
    }
}
