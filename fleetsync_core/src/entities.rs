//! Reference ("dimension") and fact ("telemetry") entities pulled from the telematics platform.
//!
//! Fact types expose their relationship to reference entities through capability traits
//! (`HasDevice`, `HasDiagnostic`, `Sampleable`). Filterers and samplers are bounded on these
//! traits, so wiring a stage to a type that lacks the relationship does not compile.

use crate::models::EntityType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Slowly-changing entity mirrored in full by a `ReferenceObjectCacher`.
pub trait ReferenceEntity: Clone + Send + Sync + 'static {
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> &str;
}

/// High-volume entity pulled incrementally by a `FeedPuller`.
pub trait FactEntity: Clone + Send + Sync + 'static {
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> &str;

    fn date_time(&self) -> DateTime<Utc>;
}

pub trait HasDevice {
    fn device_id(&self) -> &str;
}

pub trait HasDiagnostic {
    fn diagnostic_id(&self) -> &str;
}

/// Composite key used by the minimum-interval sampler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub entity_type: EntityType,
    pub device_id: String,
    pub diagnostic_id: Option<String>,
}

/// Fact entities that support minimum-interval downsampling.
pub trait Sampleable: FactEntity + HasDevice {
    /// Whether samples are keyed per diagnostic as well as per device.
    const DIAGNOSTIC_SCOPED: bool;

    fn sample_key(&self) -> SampleKey;

    /// Diagnostic the entity reports, for diagnostic-scoped sampling.
    fn sample_diagnostic(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub serial_number: Option<String>,
    pub device_type: Option<String>,
    pub active_from: Option<DateTime<Utc>>,
    pub active_to: Option<DateTime<Utc>>,
    /// Upstream entity revision.
    pub version: Option<i64>,
}

impl ReferenceEntity for Device {
    const ENTITY_TYPE: EntityType = EntityType::Device;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub id: String,
    pub name: String,
    pub code: Option<i64>,
    pub unit_of_measure: Option<String>,
    pub source: Option<String>,
}

impl ReferenceEntity for Diagnostic {
    const ENTITY_TYPE: EntityType = EntityType::Diagnostic;

    fn id(&self) -> &str {
        &self.id
    }
}

/// GPS position sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub device_id: String,
    pub date_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f32,
}

impl FactEntity for LogRecord {
    const ENTITY_TYPE: EntityType = EntityType::LogRecord;

    fn id(&self) -> &str {
        &self.id
    }

    fn date_time(&self) -> DateTime<Utc> {
        self.date_time
    }
}

impl HasDevice for LogRecord {
    fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Sampleable for LogRecord {
    const DIAGNOSTIC_SCOPED: bool = false;

    fn sample_key(&self) -> SampleKey {
        SampleKey {
            entity_type: Self::ENTITY_TYPE,
            device_id: self.device_id.clone(),
            diagnostic_id: None,
        }
    }
}

/// Engine/sensor reading for one diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub id: String,
    pub device_id: String,
    pub diagnostic_id: String,
    pub date_time: DateTime<Utc>,
    pub data: Option<f64>,
}

impl FactEntity for StatusData {
    const ENTITY_TYPE: EntityType = EntityType::StatusData;

    fn id(&self) -> &str {
        &self.id
    }

    fn date_time(&self) -> DateTime<Utc> {
        self.date_time
    }
}

impl HasDevice for StatusData {
    fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl HasDiagnostic for StatusData {
    fn diagnostic_id(&self) -> &str {
        &self.diagnostic_id
    }
}

impl Sampleable for StatusData {
    const DIAGNOSTIC_SCOPED: bool = true;

    fn sample_key(&self) -> SampleKey {
        SampleKey {
            entity_type: Self::ENTITY_TYPE,
            device_id: self.device_id.clone(),
            diagnostic_id: Some(self.diagnostic_id.clone()),
        }
    }

    fn sample_diagnostic(&self) -> Option<&str> {
        Some(&self.diagnostic_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultData {
    pub id: String,
    pub device_id: String,
    pub diagnostic_id: String,
    pub date_time: DateTime<Utc>,
    pub failure_mode: Option<String>,
    pub fault_state: Option<String>,
}

impl FactEntity for FaultData {
    const ENTITY_TYPE: EntityType = EntityType::FaultData;

    fn id(&self) -> &str {
        &self.id
    }

    fn date_time(&self) -> DateTime<Utc> {
        self.date_time
    }
}

impl HasDevice for FaultData {
    fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl HasDiagnostic for FaultData {
    fn diagnostic_id(&self) -> &str {
        &self.diagnostic_id
    }
}
