use crate::environment::AdapterVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseKindError {
    #[error("unknown service id: {0}")]
    UnknownService(String),
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),
}

/// Logical services sharing one database. Each may run on a different machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Orchestrator,
    DatabaseMaintenance,
    DeviceCache,
    DiagnosticCache,
    LogRecordFeed,
    StatusDataFeed,
    FaultDataFeed,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 7] = [
        ServiceKind::Orchestrator,
        ServiceKind::DatabaseMaintenance,
        ServiceKind::DeviceCache,
        ServiceKind::DiagnosticCache,
        ServiceKind::LogRecordFeed,
        ServiceKind::StatusDataFeed,
        ServiceKind::FaultDataFeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Orchestrator => "orchestrator",
            ServiceKind::DatabaseMaintenance => "database_maintenance",
            ServiceKind::DeviceCache => "device_cache",
            ServiceKind::DiagnosticCache => "diagnostic_cache",
            ServiceKind::LogRecordFeed => "log_record_feed",
            ServiceKind::StatusDataFeed => "status_data_feed",
            ServiceKind::FaultDataFeed => "fault_data_feed",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ServiceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == needle)
            .ok_or_else(|| ParseKindError::UnknownService(s.to_string()))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Device,
    Diagnostic,
    LogRecord,
    StatusData,
    FaultData,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Device => "device",
            EntityType::Diagnostic => "diagnostic",
            EntityType::LogRecord => "log_record",
            EntityType::StatusData => "status_data",
            EntityType::FaultData => "fault_data",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "device" => Ok(EntityType::Device),
            "diagnostic" => Ok(EntityType::Diagnostic),
            "log_record" => Ok(EntityType::LogRecord),
            "status_data" => Ok(EntityType::StatusData),
            "fault_data" => Ok(EntityType::FaultData),
            _ => Err(ParseKindError::UnknownEntityType(s.to_string())),
        }
    }
}

/// Opaque, monotonically advancing position in an upstream data feed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedVersion(pub i64);

impl fmt::Display for FeedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-service bookkeeping row, shared by every machine running against the database.
///
/// Used both for cursor resumption and for distributed-safety validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTrackingRecord {
    pub service: ServiceKind,
    pub adapter_version: Option<AdapterVersion>,
    pub adapter_machine_name: Option<String>,
    pub last_processed_feed_version: Option<FeedVersion>,
    pub entities_last_processed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl ServiceTrackingRecord {
    pub fn new(service: ServiceKind) -> Self {
        Self {
            service,
            adapter_version: None,
            adapter_machine_name: None,
            last_processed_feed_version: None,
            entities_last_processed_at: None,
            started_at: None,
            last_heartbeat_at: None,
        }
    }

    /// True when the service heartbeated within `timeout` of `now`.
    pub fn is_running(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.last_heartbeat_at
            .map(|hb| now.signed_duration_since(hb) <= timeout)
            .unwrap_or(false)
    }

    /// True when the service has processed at least one batch since it last started.
    pub fn has_processed_since_start(&self) -> bool {
        match (self.entities_last_processed_at, self.started_at) {
            (Some(processed), Some(started)) => processed >= started,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn service_kind_roundtrips_through_str() {
        for kind in ServiceKind::ALL {
            assert_eq!(kind.as_str().parse::<ServiceKind>().unwrap(), kind);
        }
        assert_eq!(
            " Device_Cache ".parse::<ServiceKind>().unwrap(),
            ServiceKind::DeviceCache
        );
        assert!("gps".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn tracking_record_liveness() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut rec = ServiceTrackingRecord::new(ServiceKind::DeviceCache);
        assert!(!rec.is_running(now, chrono::Duration::seconds(60)));

        rec.last_heartbeat_at = Some(now - chrono::Duration::seconds(30));
        assert!(rec.is_running(now, chrono::Duration::seconds(60)));
        assert!(!rec.is_running(now, chrono::Duration::seconds(10)));

        rec.started_at = Some(now - chrono::Duration::minutes(5));
        assert!(!rec.has_processed_since_start());
        rec.entities_last_processed_at = Some(now - chrono::Duration::minutes(10));
        assert!(!rec.has_processed_since_start());
        rec.entities_last_processed_at = Some(now - chrono::Duration::minutes(1));
        assert!(rec.has_processed_since_start());
    }
}
