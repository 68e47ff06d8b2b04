//! Seams to the external collaborators: the telematics API and the relational store.
//!
//! Upstream transport/authentication and the production persistence layer live outside the
//! core. `crate::memory` and `crate::store::sqlite` provide in-tree implementations.

use crate::Result;
use crate::environment::AdapterVersion;
use crate::models::{FeedVersion, ServiceKind, ServiceTrackingRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimal liveness check against a dependency (a trivial read or metadata call).
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Name used in logs, e.g. "database" or "upstream".
    fn name(&self) -> &'static str;

    async fn probe(&self) -> Result<()>;
}

/// Where the next feed retrieval should start.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum FeedRequest {
    /// Continue from a cursor; `None` starts at the beginning of the feed.
    FromVersion(Option<FeedVersion>),
    /// Start at the first record on or after a timestamp.
    FromDate(DateTime<Utc>),
}

/// Output from a feed pull() call.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedBatch<T> {
    pub to_version: FeedVersion,
    pub data: Vec<T>,
}

/// Incremental source of fact entities.
#[async_trait]
pub trait FeedSource<T>: Send + Sync {
    async fn pull(&self, request: FeedRequest, results_limit: usize) -> Result<FeedBatch<T>>;
}

/// Source of reference entities: full listing plus an optional incremental feed.
#[async_trait]
pub trait ReferenceSource<T>: Send + Sync {
    async fn get_all(&self) -> Result<Vec<T>>;

    async fn pull(&self, request: FeedRequest, results_limit: usize) -> Result<FeedBatch<T>>;
}

/// Persisted per-service tracking table.
#[async_trait]
pub trait ServiceTracker: Send + Sync {
    async fn tracking_records(&self) -> Result<Vec<ServiceTrackingRecord>>;

    async fn tracking_record(&self, service: ServiceKind) -> Result<Option<ServiceTrackingRecord>>;

    /// Create the record if missing and stamp `started_at`.
    async fn register_service(
        &self,
        service: ServiceKind,
        started_at: DateTime<Utc>,
    ) -> Result<ServiceTrackingRecord>;

    /// Record which adapter version and machine now own `service`.
    async fn stamp_identity(
        &self,
        service: ServiceKind,
        version: &AdapterVersion,
        machine_name: &str,
    ) -> Result<()>;

    async fn heartbeat(&self, service: ServiceKind, at: DateTime<Utc>) -> Result<()>;

    /// Mark that `service` processed data, optionally advancing its cursor.
    async fn record_processed(
        &self,
        service: ServiceKind,
        feed_version: Option<FeedVersion>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Overwrite the cursor without touching other fields.
    async fn rewrite_cursor(&self, service: ServiceKind, feed_version: Option<FeedVersion>)
    -> Result<()>;
}

/// Idempotent bulk upsert of cached reference entities.
#[async_trait]
pub trait ReferenceStore<T>: Send + Sync {
    async fn upsert(&self, items: &[T], at: DateTime<Utc>) -> Result<u64>;
}

/// Commit path for fact entities.
///
/// Implementations must write `batch` and advance the service cursor to `to_version` in one
/// transaction. A write rejected by a foreign key must surface as
/// `Error::ForeignKeyViolation`.
#[async_trait]
pub trait FactStore<T>: Send + Sync {
    async fn persist(
        &self,
        service: ServiceKind,
        batch: &[T],
        to_version: FeedVersion,
        processed_at: DateTime<Utc>,
    ) -> Result<u64>;
}

#[async_trait]
pub trait MaintenanceStore: Send + Sync {
    async fn run_maintenance(&self) -> Result<()>;
}
