use crate::config::SamplingConfig;
use crate::entities::{SampleKey, Sampleable};
use crate::pipeline::BatchStage;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::marker::PhantomData;

/// Drops entities that arrive within `min_interval` of the last kept entity for the same key.
///
/// Keys are `(entity type, device, diagnostic?)`. Timestamps kept by `apply` are staged in
/// `pending` and only move into `last_kept` on `commit`, after the batch is persisted. A
/// discarded batch leaves `last_kept` untouched.
pub struct MinimumIntervalSampler<T> {
    enabled: bool,
    min_interval: Duration,
    /// Diagnostic-scoped types only sample these diagnostics.
    diagnostics: HashSet<String>,
    last_kept: DashMap<SampleKey, DateTime<Utc>>,
    pending: DashMap<SampleKey, DateTime<Utc>>,
    _entity: PhantomData<fn(T)>,
}

impl<T: Sampleable> MinimumIntervalSampler<T> {
    #[tracing::instrument(level = "debug", fields(entity_type = %T::ENTITY_TYPE))]
    pub fn new(config: &SamplingConfig) -> Self {
        let diagnostics: HashSet<String> = config
            .diagnostic_ids
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && *s != "*")
            .map(str::to_string)
            .collect();
        let enabled = config.enabled && (!T::DIAGNOSTIC_SCOPED || !diagnostics.is_empty());
        if config.enabled && !enabled {
            tracing::info!(
                entity_type = %T::ENTITY_TYPE,
                "sampling enabled without a diagnostic list; passing everything through"
            );
        }
        let min_interval = i64::try_from(config.min_interval_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Self {
            enabled,
            min_interval,
            diagnostics,
            last_kept: DashMap::new(),
            pending: DashMap::new(),
            _entity: PhantomData,
        }
    }

    pub fn disabled() -> Self {
        Self::new(&SamplingConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of keys with a committed timestamp.
    pub fn tracked_keys(&self) -> usize {
        self.last_kept.len()
    }

    pub fn apply(&self, mut batch: Vec<T>) -> Vec<T> {
        if !self.enabled {
            return batch;
        }
        let before = batch.len();
        batch.retain(|item| self.keep(item));
        tracing::debug!(
            entity_type = %T::ENTITY_TYPE,
            count = batch.len(),
            dropped = before - batch.len(),
            "sampled batch"
        );
        batch
    }

    /// Promote timestamps staged by `apply` to the committed map.
    pub fn commit(&self) {
        let staged: Vec<(SampleKey, DateTime<Utc>)> = self
            .pending
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        self.pending.clear();
        for (key, ts) in staged {
            self.last_kept.insert(key, ts);
        }
    }

    pub fn discard(&self) {
        self.pending.clear();
    }

    fn keep(&self, item: &T) -> bool {
        if T::DIAGNOSTIC_SCOPED {
            let sampled = item
                .sample_diagnostic()
                .is_some_and(|d| self.diagnostics.contains(d));
            if !sampled {
                return true;
            }
        }
        let key = item.sample_key();
        let ts = item.date_time();
        let last = match self.pending.get(&key) {
            Some(staged) => Some(*staged),
            None => self.last_kept.get(&key).map(|kept| *kept),
        };
        let keep = match last {
            None => true,
            // An interval that overflows the calendar never elapses.
            Some(last) => last
                .checked_add_signed(self.min_interval)
                .is_some_and(|next| ts > next),
        };
        if keep {
            self.pending.insert(key, ts);
        }
        keep
    }
}

impl<T: Sampleable> BatchStage<T> for MinimumIntervalSampler<T> {
    fn name(&self) -> &'static str {
        "min_interval_sampler"
    }

    fn apply(&self, batch: Vec<T>) -> Vec<T> {
        MinimumIntervalSampler::apply(self, batch)
    }

    fn commit(&self) {
        MinimumIntervalSampler::commit(self)
    }

    fn discard(&self) {
        MinimumIntervalSampler::discard(self)
    }
}
