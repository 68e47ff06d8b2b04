//! fleetsync core: keeps a relational database in sync with a telematics platform's data feeds.
//!
//! Several logical services (reference caches, fact feeds, maintenance) share one database and
//! may run on different machines. They coordinate through persisted tracking records and an
//! in-process connectivity state machine.

pub mod config;
pub mod coordination;
pub mod entities;
pub mod environment;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod memory;
pub mod models;
pub mod o11y;
pub mod pipeline;
pub mod reference;
pub mod state;
pub mod store;
pub mod traits;

pub use config::{FeedConfig, FeedStartOption, ReferenceCacheConfig, SyncConfig};
pub use coordination::{
    ForeignKeyServiceDependencyMap, OrchestratorReadiness, PrerequisiteCoordinator,
    ServiceAwaiter, ServicePauseRegistry,
};
pub use entities::{Device, Diagnostic, FaultData, LogRecord, StatusData};
pub use environment::{AdapterVersion, EnvironmentIdentity, EnvironmentValidator};
pub use error::{Error, Result};
pub use models::{EntityType, FeedVersion, ServiceKind, ServiceTrackingRecord};
pub use state::{ConnectivityState, StateMachine, WaitReason};
pub use traits::{
    FactStore, FeedBatch, FeedRequest, FeedSource, LivenessProbe, MaintenanceStore,
    ReferenceSource, ReferenceStore, ServiceTracker,
};
