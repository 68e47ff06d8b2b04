//! In-process fleet simulator standing in for the telematics platform during local runs.
//!
//! Devices and diagnostics are fixed at startup. A generator task appends one GPS point and
//! one reading per diagnostic for every device on each tick, and occasionally a fault.

use chrono::{DateTime, Utc};
use fleetsync_core::entities::{Device, Diagnostic, FaultData, LogRecord, StatusData};
use fleetsync_core::memory::{ScriptedFeedSource, StaticProbe, StaticReferenceSource};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::runner::Upstream;

const DIAGNOSTICS: [(&str, &str, i64, &str); 3] = [
    ("DiagnosticEngineSpeedId", "Engine speed", 190, "rpm"),
    ("DiagnosticCoolantTemperatureId", "Engine coolant temperature", 110, "°C"),
    ("DiagnosticFuelLevelId", "Fuel level", 96, "%"),
];

/// Every fault is raised against this diagnostic.
const FAULT_DIAGNOSTIC: &str = "DiagnosticCoolantTemperatureId";

pub struct SimulatedFleet {
    pub probe: Arc<StaticProbe>,
    pub devices: Arc<StaticReferenceSource<Device>>,
    pub diagnostics: Arc<StaticReferenceSource<Diagnostic>>,
    pub log_records: Arc<ScriptedFeedSource<LogRecord>>,
    pub status_data: Arc<ScriptedFeedSource<StatusData>>,
    pub fault_data: Arc<ScriptedFeedSource<FaultData>>,
    device_ids: Vec<String>,
}

impl SimulatedFleet {
    #[tracing::instrument(level = "debug")]
    pub fn new(fleet_size: usize, now: DateTime<Utc>) -> Self {
        let devices: Vec<Device> = (1..=fleet_size)
            .map(|n| Device {
                id: format!("b{n}"),
                name: format!("Truck {n:03}"),
                serial_number: Some(format!("G9{n:010}")),
                device_type: Some("GO9".to_string()),
                active_from: Some(now),
                active_to: None,
                version: Some(1),
            })
            .collect();
        let diagnostics: Vec<Diagnostic> = DIAGNOSTICS
            .iter()
            .map(|(id, name, code, unit)| Diagnostic {
                id: id.to_string(),
                name: name.to_string(),
                code: Some(*code),
                unit_of_measure: Some(unit.to_string()),
                source: Some("SourceJ1939".to_string()),
            })
            .collect();
        let device_ids = devices.iter().map(|d| d.id.clone()).collect();

        Self {
            probe: Arc::new(StaticProbe::healthy("upstream")),
            devices: Arc::new(StaticReferenceSource::new(devices)),
            diagnostics: Arc::new(StaticReferenceSource::new(diagnostics)),
            log_records: Arc::new(ScriptedFeedSource::new()),
            status_data: Arc::new(ScriptedFeedSource::new()),
            fault_data: Arc::new(ScriptedFeedSource::new()),
            device_ids,
        }
    }

    pub fn upstream(&self) -> Upstream {
        Upstream {
            probe: self.probe.clone(),
            devices: self.devices.clone(),
            diagnostics: self.diagnostics.clone(),
            log_records: self.log_records.clone(),
            status_data: self.status_data.clone(),
            fault_data: self.fault_data.clone(),
        }
    }

    /// Append one burst of telemetry stamped `at`.
    pub async fn emit(&self, tick: u64, at: DateTime<Utc>) {
        let mut positions = Vec::with_capacity(self.device_ids.len());
        let mut readings = Vec::with_capacity(self.device_ids.len() * DIAGNOSTICS.len());
        let mut faults = Vec::new();

        for (n, device_id) in self.device_ids.iter().enumerate() {
            let phase = tick as f64 / 20.0 + n as f64;
            positions.push(LogRecord {
                id: Uuid::new_v4().to_string(),
                device_id: device_id.clone(),
                date_time: at,
                latitude: 43.65 + 0.01 * phase.sin(),
                longitude: -79.38 + 0.01 * phase.cos(),
                speed: (60.0 + 30.0 * phase.sin()) as f32,
            });
            for (i, (diagnostic_id, ..)) in DIAGNOSTICS.iter().enumerate() {
                readings.push(StatusData {
                    id: Uuid::new_v4().to_string(),
                    device_id: device_id.clone(),
                    diagnostic_id: diagnostic_id.to_string(),
                    date_time: at,
                    data: Some(reading(i, phase)),
                });
            }
            if (tick + n as u64) % 50 == 0 {
                faults.push(FaultData {
                    id: Uuid::new_v4().to_string(),
                    device_id: device_id.clone(),
                    diagnostic_id: FAULT_DIAGNOSTIC.to_string(),
                    date_time: at,
                    failure_mode: Some("Above normal operating range".to_string()),
                    fault_state: Some("Active".to_string()),
                });
            }
        }

        self.log_records.push(positions).await;
        self.status_data.push(readings).await;
        if !faults.is_empty() {
            self.fault_data.push(faults).await;
        }
    }

    /// Emit telemetry every `every` until cancelled.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_generator(&self, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        let mut tick = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.emit(tick, Utc::now()).await;
                    tick += 1;
                    if tick % 30 == 0 {
                        let log_records = self.log_records.len().await;
                        tracing::debug!(
                            tick,
                            log_records,
                            "simulated fleet emitted telemetry"
                        );
                    }
                }
            }
        }
    }
}

fn reading(diagnostic_index: usize, phase: f64) -> f64 {
    match diagnostic_index {
        0 => 1500.0 + 600.0 * phase.sin(),
        1 => 88.0 + 6.0 * phase.cos(),
        _ => (75.0 - phase).rem_euclid(100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_core::traits::{FeedRequest, FeedSource, ReferenceSource};

    #[tokio::test]
    async fn emit_appends_one_burst_per_device() {
        let fleet = SimulatedFleet::new(3, Utc::now());
        assert_eq!(fleet.devices.get_all().await.unwrap().len(), 3);
        assert_eq!(fleet.diagnostics.get_all().await.unwrap().len(), DIAGNOSTICS.len());

        fleet.emit(1, Utc::now()).await;
        fleet.emit(2, Utc::now()).await;
        assert_eq!(fleet.log_records.len().await, 6);
        assert_eq!(fleet.status_data.len().await, 6 * DIAGNOSTICS.len());

        let batch = fleet
            .log_records
            .pull(FeedRequest::FromVersion(None), 100)
            .await
            .unwrap();
        assert_eq!(batch.data.len(), 6);
        assert!(batch.data.iter().all(|r| r.device_id.starts_with('b')));
    }

    #[tokio::test]
    async fn faults_reference_a_known_diagnostic() {
        let fleet = SimulatedFleet::new(2, Utc::now());
        for tick in 0..60 {
            fleet.emit(tick, Utc::now()).await;
        }
        let faults = fleet
            .fault_data
            .pull(FeedRequest::FromVersion(None), 1000)
            .await
            .unwrap()
            .data;
        assert!(!faults.is_empty());
        assert!(faults.iter().all(|f| f.diagnostic_id == FAULT_DIAGNOSTIC));
    }
}
