//! Long-running drivers: fact ingestion loops, the orchestrator and database maintenance.
//!
//! Every driver runs as its own tokio task and shares one `CancellationToken` with the rest
//! of the process.

pub mod fact;
pub mod maintenance;
pub mod orchestrator;

pub use fact::{FactIngestService, IterationOutcome, PipelineFactory};
pub use maintenance::{DatabaseMaintenanceService, MaintenanceOutcome};
pub use orchestrator::Orchestrator;
