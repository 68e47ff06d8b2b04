use crate::coordination::fk_map::parse_dependency_pairs;
use crate::models::ServiceKind;
use crate::{Error, Result};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Upper bound the upstream API accepts for a single feed call.
pub const MAX_RESULTS_LIMIT: usize = 50_000;

/// Longest accepted sampling interval: one week.
pub const MAX_SAMPLING_INTERVAL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Schedule for one cached reference collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCacheConfig {
    /// Time of day (UTC) that anchors both update and refresh boundaries.
    pub daily_reference_time: NaiveTime,
    pub update_interval_minutes: u32,
    pub refresh_interval_minutes: u32,
    pub feed_results_limit: usize,
    /// Pull incremental changes from the feed instead of re-listing everything on update.
    pub use_feed: bool,
}

impl Default for ReferenceCacheConfig {
    fn default() -> Self {
        Self {
            daily_reference_time: NaiveTime::default(),
            update_interval_minutes: 5,
            refresh_interval_minutes: 24 * 60,
            feed_results_limit: 5_000,
            use_feed: true,
        }
    }
}

impl ReferenceCacheConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.update_interval_minutes == 0 {
            return Err(Error::InvalidInput(format!(
                "{name}.update_interval_minutes must be > 0"
            )));
        }
        if self.refresh_interval_minutes == 0 {
            return Err(Error::InvalidInput(format!(
                "{name}.refresh_interval_minutes must be > 0"
            )));
        }
        validate_results_limit(name, self.feed_results_limit)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStartOption {
    /// Resume from the stored cursor (or the start of the feed).
    FeedVersion,
    /// Start at the moment of the first poll.
    CurrentTime,
    /// Start at a configured timestamp.
    SpecificTime,
}

impl FeedStartOption {
    #[tracing::instrument(level = "debug")]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feed_version" | "feedversion" => Some(Self::FeedVersion),
            "current_time" | "currenttime" => Some(Self::CurrentTime),
            "specific_time" | "specifictime" => Some(Self::SpecificTime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub polling_interval_seconds: u64,
    pub results_limit: usize,
    pub start_option: FeedStartOption,
    /// Required when `start_option` is `SpecificTime`.
    pub start_time: Option<DateTime<Utc>>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            polling_interval_seconds: 30,
            results_limit: 50_000,
            start_option: FeedStartOption::CurrentTime,
            start_time: None,
        }
    }
}

impl FeedConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.polling_interval_seconds == 0 {
            return Err(Error::InvalidInput(format!(
                "{name}.polling_interval_seconds must be > 0"
            )));
        }
        if self.start_option == FeedStartOption::SpecificTime && self.start_time.is_none() {
            return Err(Error::InvalidInput(format!(
                "{name}.start_time is required when start_option is specific_time"
            )));
        }
        validate_results_limit(name, self.results_limit)
    }
}

fn validate_results_limit(name: &str, limit: usize) -> Result<()> {
    if limit == 0 || limit > MAX_RESULTS_LIMIT {
        return Err(Error::InvalidInput(format!(
            "{name}.results_limit must be within 1..={MAX_RESULTS_LIMIT}"
        )));
    }
    Ok(())
}

/// Device/diagnostic allow-lists. Empty (or `*`) tracks everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub devices_to_track: Vec<String>,
    pub diagnostics_to_track: Vec<String>,
    /// Treat `diagnostics_to_track` as a deny-list.
    pub exclude_diagnostics_to_track: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub enabled: bool,
    pub min_interval_seconds: u64,
    /// Diagnostic-scoped types only. Empty (or `*`) disables sampling.
    pub diagnostic_ids: Vec<String>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval_seconds: 60,
            diagnostic_ids: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    pub prerequisite_check_interval: Duration,
    /// A prerequisite whose last heartbeat is older than this is considered not running.
    pub heartbeat_timeout: Duration,
    /// Minimum spacing between repeated "still waiting" log lines.
    pub prerequisite_log_interval: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            prerequisite_check_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(5 * 60),
            prerequisite_log_interval: Duration::from_secs(60),
        }
    }
}

/// Complete runtime configuration for a fleetsync process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub database_url: String,
    /// Logical services this process runs. Machines sharing one database split these.
    pub hosted_services: BTreeSet<ServiceKind>,
    pub device_cache: ReferenceCacheConfig,
    pub diagnostic_cache: ReferenceCacheConfig,
    pub log_record_feed: FeedConfig,
    pub status_data_feed: FeedConfig,
    pub fault_data_feed: FeedConfig,
    pub filters: FilterConfig,
    pub log_record_sampling: SamplingConfig,
    pub status_data_sampling: SamplingConfig,
    /// Services that stop during database maintenance.
    pub pause_for_maintenance: BTreeSet<ServiceKind>,
    pub disable_machine_name_validation: bool,
    /// `(constraint name, prerequisite service)` pairs.
    pub foreign_key_dependencies: Vec<(String, ServiceKind)>,
    pub validation_interval: Duration,
    pub maintenance_interval: Duration,
    pub coordination: CoordinationConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://fleetsync.db?mode=rwc".to_string(),
            hosted_services: ServiceKind::ALL.into_iter().collect(),
            device_cache: ReferenceCacheConfig::default(),
            diagnostic_cache: ReferenceCacheConfig {
                update_interval_minutes: 60,
                ..ReferenceCacheConfig::default()
            },
            log_record_feed: FeedConfig::default(),
            status_data_feed: FeedConfig::default(),
            fault_data_feed: FeedConfig::default(),
            filters: FilterConfig::default(),
            log_record_sampling: SamplingConfig::default(),
            status_data_sampling: SamplingConfig::default(),
            pause_for_maintenance: [
                ServiceKind::LogRecordFeed,
                ServiceKind::StatusDataFeed,
                ServiceKind::FaultDataFeed,
            ]
            .into_iter()
            .collect(),
            disable_machine_name_validation: false,
            foreign_key_dependencies: default_foreign_key_dependencies(),
            validation_interval: Duration::from_secs(5 * 60),
            maintenance_interval: Duration::from_secs(24 * 60 * 60),
            coordination: CoordinationConfig::default(),
        }
    }
}

/// Constraint names emitted by the bundled SQLite store.
pub fn default_foreign_key_dependencies() -> Vec<(String, ServiceKind)> {
    vec![
        ("fk_log_records_devices".to_string(), ServiceKind::DeviceCache),
        ("fk_status_data_devices".to_string(), ServiceKind::DeviceCache),
        (
            "fk_status_data_diagnostics".to_string(),
            ServiceKind::DiagnosticCache,
        ),
        ("fk_fault_data_devices".to_string(), ServiceKind::DeviceCache),
        (
            "fk_fault_data_diagnostics".to_string(),
            ServiceKind::DiagnosticCache,
        ),
    ]
}

impl SyncConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary `FLEETSYNC_*` key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = EnvReader { lookup: &lookup };
        let mut cfg = Self::default();

        if let Some(url) = env.string("FLEETSYNC_DATABASE_URL") {
            cfg.database_url = url;
        }

        env.reference_cache("FLEETSYNC_DEVICE_CACHE", &mut cfg.device_cache)?;
        env.reference_cache("FLEETSYNC_DIAGNOSTIC_CACHE", &mut cfg.diagnostic_cache)?;
        env.feed("FLEETSYNC_LOG_RECORD_FEED", &mut cfg.log_record_feed)?;
        env.feed("FLEETSYNC_STATUS_DATA_FEED", &mut cfg.status_data_feed)?;
        env.feed("FLEETSYNC_FAULT_DATA_FEED", &mut cfg.fault_data_feed)?;

        if let Some(list) = env.list("FLEETSYNC_DEVICES_TO_TRACK") {
            cfg.filters.devices_to_track = list;
        }
        if let Some(list) = env.list("FLEETSYNC_DIAGNOSTICS_TO_TRACK") {
            cfg.filters.diagnostics_to_track = list;
        }
        if let Some(b) = env.bool("FLEETSYNC_EXCLUDE_DIAGNOSTICS_TO_TRACK")? {
            cfg.filters.exclude_diagnostics_to_track = b;
        }

        if let Some(b) = env.bool("FLEETSYNC_LOG_RECORD_SAMPLING_ENABLED")? {
            cfg.log_record_sampling.enabled = b;
        }
        if let Some(n) = env.u64("FLEETSYNC_LOG_RECORD_SAMPLING_INTERVAL_SECONDS")? {
            cfg.log_record_sampling.min_interval_seconds = n;
        }
        if let Some(b) = env.bool("FLEETSYNC_STATUS_DATA_SAMPLING_ENABLED")? {
            cfg.status_data_sampling.enabled = b;
        }
        if let Some(n) = env.u64("FLEETSYNC_STATUS_DATA_SAMPLING_INTERVAL_SECONDS")? {
            cfg.status_data_sampling.min_interval_seconds = n;
        }
        if let Some(list) = env.list("FLEETSYNC_STATUS_DATA_SAMPLING_DIAGNOSTICS") {
            cfg.status_data_sampling.diagnostic_ids = list;
        }

        if let Some(services) = env.services("FLEETSYNC_HOSTED_SERVICES")? {
            cfg.hosted_services = services;
        }
        if let Some(services) = env.services("FLEETSYNC_PAUSE_FOR_MAINTENANCE")? {
            cfg.pause_for_maintenance = services;
        }
        if let Some(b) = env.bool("FLEETSYNC_DISABLE_MACHINE_NAME_VALIDATION")? {
            cfg.disable_machine_name_validation = b;
        }
        if let Some(raw) = env.string("FLEETSYNC_FOREIGN_KEY_DEPENDENCIES") {
            cfg.foreign_key_dependencies = parse_dependency_pairs(&raw)?;
        }
        if let Some(n) = env.u64("FLEETSYNC_VALIDATION_INTERVAL_SECONDS")? {
            cfg.validation_interval = Duration::from_secs(n);
        }
        if let Some(n) = env.u64("FLEETSYNC_MAINTENANCE_INTERVAL_MINUTES")? {
            let secs = n.checked_mul(60).ok_or_else(|| {
                Error::InvalidInput(
                    "FLEETSYNC_MAINTENANCE_INTERVAL_MINUTES is out of range".to_string(),
                )
            })?;
            cfg.maintenance_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env.u64("FLEETSYNC_PREREQUISITE_CHECK_INTERVAL_MS")? {
            cfg.coordination.prerequisite_check_interval = Duration::from_millis(n);
        }
        if let Some(n) = env.u64("FLEETSYNC_HEARTBEAT_TIMEOUT_SECONDS")? {
            cfg.coordination.heartbeat_timeout = Duration::from_secs(n);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::InvalidInput("database_url is empty".to_string()));
        }
        if self.hosted_services.is_empty() {
            return Err(Error::InvalidInput("hosted_services is empty".to_string()));
        }
        self.device_cache.validate("device_cache")?;
        self.diagnostic_cache.validate("diagnostic_cache")?;
        self.log_record_feed.validate("log_record_feed")?;
        self.status_data_feed.validate("status_data_feed")?;
        self.fault_data_feed.validate("fault_data_feed")?;

        for (name, sampling) in [
            ("log_record_sampling", &self.log_record_sampling),
            ("status_data_sampling", &self.status_data_sampling),
        ] {
            if sampling.enabled && sampling.min_interval_seconds == 0 {
                return Err(Error::InvalidInput(format!(
                    "{name}.min_interval_seconds must be > 0 when sampling is enabled"
                )));
            }
            if sampling.min_interval_seconds > MAX_SAMPLING_INTERVAL_SECONDS {
                return Err(Error::InvalidInput(format!(
                    "{name}.min_interval_seconds must be <= {MAX_SAMPLING_INTERVAL_SECONDS}"
                )));
            }
        }

        if self.validation_interval.is_zero() {
            return Err(Error::InvalidInput(
                "validation_interval must be > 0".to_string(),
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(Error::InvalidInput(
                "maintenance_interval must be > 0".to_string(),
            ));
        }
        if self.coordination.prerequisite_check_interval.is_zero() {
            return Err(Error::InvalidInput(
                "prerequisite_check_interval must be > 0".to_string(),
            ));
        }
        if self.coordination.heartbeat_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "heartbeat_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pauses_for_maintenance(&self, service: ServiceKind) -> bool {
        self.pause_for_maintenance.contains(&service)
    }

    pub fn hosts(&self, service: ServiceKind) -> bool {
        self.hosted_services.contains(&service)
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn u64(&self, key: &str) -> Result<Option<u64>> {
        self.string(key)
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| Error::InvalidInput(format!("{key} must be an integer")))
            })
            .transpose()
    }

    fn u32(&self, key: &str) -> Result<Option<u32>> {
        self.u64(key)?
            .map(|n| {
                u32::try_from(n).map_err(|_| Error::InvalidInput(format!("{key} is out of range")))
            })
            .transpose()
    }

    fn usize(&self, key: &str) -> Result<Option<usize>> {
        self.u64(key)?
            .map(|n| {
                usize::try_from(n)
                    .map_err(|_| Error::InvalidInput(format!("{key} is out of range")))
            })
            .transpose()
    }

    fn bool(&self, key: &str) -> Result<Option<bool>> {
        self.string(key)
            .map(|v| match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::InvalidInput(format!("{key} must be a boolean"))),
            })
            .transpose()
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.string(key).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    fn services(&self, key: &str) -> Result<Option<BTreeSet<ServiceKind>>> {
        self.list(key)
            .map(|list| {
                list.iter()
                    .map(|s| {
                        s.parse::<ServiceKind>()
                            .map_err(|e| Error::InvalidInput(format!("{key}: {e}")))
                    })
                    .collect::<Result<BTreeSet<_>>>()
            })
            .transpose()
    }

    fn reference_cache(&self, prefix: &str, cfg: &mut ReferenceCacheConfig) -> Result<()> {
        if let Some(n) = self.u32(&format!("{prefix}_UPDATE_INTERVAL_MINUTES"))? {
            cfg.update_interval_minutes = n;
        }
        if let Some(n) = self.u32(&format!("{prefix}_REFRESH_INTERVAL_MINUTES"))? {
            cfg.refresh_interval_minutes = n;
        }
        let key = format!("{prefix}_DAILY_REFERENCE_TIME");
        if let Some(v) = self.string(&key) {
            cfg.daily_reference_time = NaiveTime::parse_from_str(&v, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(&v, "%H:%M:%S"))
                .map_err(|_| Error::InvalidInput(format!("{key} must be HH:MM[:SS]")))?;
        }
        if let Some(n) = self.usize(&format!("{prefix}_RESULTS_LIMIT"))? {
            cfg.feed_results_limit = n;
        }
        if let Some(b) = self.bool(&format!("{prefix}_USE_FEED"))? {
            cfg.use_feed = b;
        }
        Ok(())
    }

    fn feed(&self, prefix: &str, cfg: &mut FeedConfig) -> Result<()> {
        if let Some(n) = self.u64(&format!("{prefix}_POLLING_INTERVAL_SECONDS"))? {
            cfg.polling_interval_seconds = n;
        }
        if let Some(n) = self.usize(&format!("{prefix}_RESULTS_LIMIT"))? {
            cfg.results_limit = n;
        }
        let key = format!("{prefix}_START_OPTION");
        if let Some(v) = self.string(&key) {
            cfg.start_option = FeedStartOption::parse(&v).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "{key} must be feed_version, current_time or specific_time"
                ))
            })?;
        }
        let key = format!("{prefix}_START_TIME");
        if let Some(v) = self.string(&key) {
            let t = DateTime::parse_from_rfc3339(&v)
                .map_err(|_| Error::InvalidInput(format!("{key} must be RFC 3339")))?;
            cfg.start_time = Some(t.with_timezone(&Utc));
        }
        Ok(())
    }
}
