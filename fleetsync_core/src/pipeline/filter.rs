use crate::entities::{Device, Diagnostic, HasDevice, HasDiagnostic};
use crate::pipeline::BatchStage;
use crate::reference::ReferenceObjectCacher;
use std::collections::HashSet;

/// Ids to keep (or drop, in exclude mode). Empty means pass-through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    ids: HashSet<String>,
    exclude: bool,
}

impl FilterSet {
    /// An empty list or a lone `*` tracks everything.
    pub fn from_config(configured: &[String], exclude: bool) -> Self {
        let ids: HashSet<String> = configured
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if ids.len() == 1 && ids.contains("*") {
            return Self::default();
        }
        Self { ids, exclude }
    }

    pub fn is_pass_through(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_exclude(&self) -> bool {
        self.exclude
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn admits(&self, id: &str) -> bool {
        if self.ids.is_empty() {
            return true;
        }
        self.ids.contains(id) != self.exclude
    }

    fn warn_unknown(&self, kind: &str, known: impl Fn(&str) -> bool) {
        for id in self.ids.iter().filter(|id| !known(id.as_str())) {
            tracing::warn!(id = %id, "configured {kind} id is not in the reference cache");
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceFilterer {
    set: FilterSet,
}

impl DeviceFilterer {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn build(configured_ids: &[String], devices: &ReferenceObjectCacher<Device>) -> Self {
        let set = FilterSet::from_config(configured_ids, false);
        set.warn_unknown("device", |id| devices.contains(id));
        tracing::debug!(count = set.len(), "device filter built");
        Self { set }
    }

    pub fn from_set(set: FilterSet) -> Self {
        Self { set }
    }

    pub fn set(&self) -> &FilterSet {
        &self.set
    }

    pub fn apply<T: HasDevice>(&self, mut batch: Vec<T>) -> Vec<T> {
        if !self.set.is_pass_through() {
            batch.retain(|item| self.set.admits(item.device_id()));
        }
        batch
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiagnosticFilterer {
    set: FilterSet,
}

impl DiagnosticFilterer {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn build(
        configured_ids: &[String],
        exclude: bool,
        diagnostics: &ReferenceObjectCacher<Diagnostic>,
    ) -> Self {
        let set = FilterSet::from_config(configured_ids, exclude);
        set.warn_unknown("diagnostic", |id| diagnostics.contains(id));
        tracing::debug!(count = set.len(), exclude = set.is_exclude(), "diagnostic filter built");
        Self { set }
    }

    pub fn from_set(set: FilterSet) -> Self {
        Self { set }
    }

    pub fn set(&self) -> &FilterSet {
        &self.set
    }

    pub fn apply<T: HasDiagnostic>(&self, mut batch: Vec<T>) -> Vec<T> {
        if !self.set.is_pass_through() {
            batch.retain(|item| self.set.admits(item.diagnostic_id()));
        }
        batch
    }
}

impl<T: HasDevice + Send> BatchStage<T> for DeviceFilterer {
    fn name(&self) -> &'static str {
        "device_filter"
    }

    fn apply(&self, batch: Vec<T>) -> Vec<T> {
        DeviceFilterer::apply(self, batch)
    }
}

impl<T: HasDiagnostic + Send> BatchStage<T> for DiagnosticFilterer {
    fn name(&self) -> &'static str {
        "diagnostic_filter"
    }

    fn apply(&self, batch: Vec<T>) -> Vec<T> {
        DiagnosticFilterer::apply(self, batch)
    }
}
