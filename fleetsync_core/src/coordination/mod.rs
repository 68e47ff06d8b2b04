//! Cross-service coordination: prerequisite waiting, pause tracking and FK-to-service mapping.
//!
//! Nothing here takes a cross-machine lock. Services discover each other only through the
//! shared tracking records.

pub mod awaiter;
pub mod fk_map;
pub mod prerequisites;

pub use awaiter::{IntervalWaitOutcome, PauseGuard, ServiceAwaiter, ServicePauseRegistry};
pub use fk_map::ForeignKeyServiceDependencyMap;
pub use prerequisites::{OrchestratorReadiness, PrerequisiteCoordinator, PrerequisiteStatus};
