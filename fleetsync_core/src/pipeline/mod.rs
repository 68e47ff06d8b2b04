//! Per-batch processing applied between feed retrieval and persistence.
//!
//! Stages run in order: device filter, diagnostic filter, sampler. Which stages a fact type
//! gets is decided by the builders below from its capability traits.

pub mod filter;
pub mod sampler;

use crate::config::SamplingConfig;
use crate::entities::{FaultData, LogRecord, StatusData};

pub use filter::{DeviceFilterer, DiagnosticFilterer, FilterSet};
pub use sampler::MinimumIntervalSampler;

/// One transformation over a retrieved batch. Order-preserving.
///
/// Stateful stages stage their decisions in `apply` and only make them durable on `commit`,
/// which the caller invokes once the batch has been persisted. `discard` drops staged state
/// so a re-pulled batch is judged exactly as the first time.
pub trait BatchStage<T>: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, batch: Vec<T>) -> Vec<T>;

    fn commit(&self) {}

    fn discard(&self) {}
}

pub struct EntityPipeline<T> {
    stages: Vec<Box<dyn BatchStage<T>>>,
}

impl<T> Default for EntityPipeline<T> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<T> EntityPipeline<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl BatchStage<T> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self, batch: Vec<T>) -> Vec<T> {
        self.stages.iter().fold(batch, |batch, stage| {
            let before = batch.len();
            let out = stage.apply(batch);
            if out.len() != before {
                tracing::trace!(stage = stage.name(), before, after = out.len(), "pipeline stage");
            }
            out
        })
    }

    /// Make staged decisions from the last `run` durable.
    pub fn commit(&self) {
        self.stages.iter().for_each(|s| s.commit());
    }

    pub fn discard(&self) {
        self.stages.iter().for_each(|s| s.discard());
    }
}

pub fn log_record_pipeline(
    devices: DeviceFilterer,
    sampling: &SamplingConfig,
) -> EntityPipeline<LogRecord> {
    EntityPipeline::new()
        .with_stage(devices)
        .with_stage(MinimumIntervalSampler::<LogRecord>::new(sampling))
}

pub fn status_data_pipeline(
    devices: DeviceFilterer,
    diagnostics: DiagnosticFilterer,
    sampling: &SamplingConfig,
) -> EntityPipeline<StatusData> {
    EntityPipeline::new()
        .with_stage(devices)
        .with_stage(diagnostics)
        .with_stage(MinimumIntervalSampler::<StatusData>::new(sampling))
}

pub fn fault_data_pipeline(
    devices: DeviceFilterer,
    diagnostics: DiagnosticFilterer,
) -> EntityPipeline<FaultData> {
    EntityPipeline::new()
        .with_stage(devices)
        .with_stage(diagnostics)
}
