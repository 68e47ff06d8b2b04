use crate::Result;
use crate::config::{FeedConfig, FeedStartOption};
use crate::entities::FactEntity;
use crate::models::FeedVersion;
use crate::traits::{FeedRequest, FeedSource};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The polling interval has not elapsed; nothing was requested.
    Throttled { remaining: Duration },
    Retrieved {
        count: usize,
        to_version: FeedVersion,
        full: bool,
    },
}

/// Cursor state for one fact feed.
#[derive(Debug, Clone)]
pub struct FeedCursorState<T> {
    pub pending_batch: Vec<T>,
    pub last_feed_version: Option<FeedVersion>,
    pub last_retrieval_at: Option<DateTime<Utc>>,
    pub last_batch_was_full: bool,
    pub start_option: FeedStartOption,
    pub configured_start_option: FeedStartOption,
    pub start_time: Option<DateTime<Utc>>,
}

/// Incremental puller for one fact feed.
///
/// Owned by a single ingestion loop; not shared.
pub struct FeedPuller<T> {
    source: Arc<dyn FeedSource<T>>,
    config: FeedConfig,
    state: FeedCursorState<T>,
}

impl<T: FactEntity> FeedPuller<T> {
    /// `last_processed_version` is the committed cursor from the tracking record. When set,
    /// it wins over the configured start option.
    #[tracing::instrument(
        level = "debug",
        skip(source, config),
        fields(entity_type = %T::ENTITY_TYPE)
    )]
    pub fn new(
        source: Arc<dyn FeedSource<T>>,
        config: FeedConfig,
        last_processed_version: Option<FeedVersion>,
    ) -> Self {
        let start_option = if last_processed_version.is_some() {
            FeedStartOption::FeedVersion
        } else {
            config.start_option
        };
        let state = FeedCursorState {
            pending_batch: Vec::new(),
            last_feed_version: last_processed_version,
            last_retrieval_at: None,
            last_batch_was_full: false,
            start_option,
            configured_start_option: config.start_option,
            start_time: config.start_time,
        };
        Self {
            source,
            config,
            state,
        }
    }

    pub async fn poll(&mut self) -> Result<PollOutcome> {
        self.poll_at(Utc::now()).await
    }

    /// Retrieve the next batch unless throttled.
    ///
    /// A full previous batch means the feed has a backlog, so the throttle is skipped.
    #[tracing::instrument(level = "debug", skip(self), fields(entity_type = %T::ENTITY_TYPE))]
    pub async fn poll_at(&mut self, now: DateTime<Utc>) -> Result<PollOutcome> {
        if let Some(remaining) = self.throttle_remaining(now) {
            return Ok(PollOutcome::Throttled { remaining });
        }

        let request = match self.state.start_option {
            FeedStartOption::FeedVersion => FeedRequest::FromVersion(self.state.last_feed_version),
            FeedStartOption::CurrentTime => FeedRequest::FromDate(now),
            FeedStartOption::SpecificTime => {
                FeedRequest::FromDate(self.state.start_time.unwrap_or(now))
            }
        };
        let batch = self.source.pull(request, self.config.results_limit).await?;

        let full = batch.data.len() >= self.config.results_limit;
        self.state.pending_batch = dedupe_last_wins(batch.data);
        self.state.last_feed_version = Some(batch.to_version);
        self.state.last_retrieval_at = Some(now);
        self.state.last_batch_was_full = full;
        self.state.start_option = FeedStartOption::FeedVersion;

        let count = self.state.pending_batch.len();
        tracing::debug!(
            entity_type = %T::ENTITY_TYPE,
            count,
            feed_version = %batch.to_version,
            full,
            "feed batch retrieved"
        );
        Ok(PollOutcome::Retrieved {
            count,
            to_version: batch.to_version,
            full,
        })
    }

    /// Reset the cursor to the last committed version so the next poll re-fetches.
    #[tracing::instrument(level = "debug", skip(self), fields(entity_type = %T::ENTITY_TYPE))]
    pub fn rollback(&mut self, last_processed: Option<FeedVersion>) {
        self.state.last_feed_version = last_processed;
        self.state.last_retrieval_at = None;
        self.state.last_batch_was_full = false;
        self.state.pending_batch.clear();
        match last_processed {
            Some(_) => self.state.start_option = FeedStartOption::FeedVersion,
            None if self.state.start_option != self.state.configured_start_option => {
                self.state.start_option = self.state.configured_start_option;
            }
            None => {}
        }
        tracing::info!(
            entity_type = %T::ENTITY_TYPE,
            feed_version = ?last_processed,
            start_option = ?self.state.start_option,
            "feed cursor rolled back"
        );
    }

    pub fn last_feed_version(&self) -> Option<FeedVersion> {
        self.state.last_feed_version
    }

    pub fn start_option(&self) -> FeedStartOption {
        self.state.start_option
    }

    pub fn pending_batch(&self) -> &[T] {
        &self.state.pending_batch
    }

    pub fn take_pending_batch(&mut self) -> Vec<T> {
        std::mem::take(&mut self.state.pending_batch)
    }

    pub fn last_batch_was_full(&self) -> bool {
        self.state.last_batch_was_full
    }

    pub fn state(&self) -> &FeedCursorState<T> {
        &self.state
    }

    fn throttle_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.state.last_batch_was_full {
            return None;
        }
        let last = self.state.last_retrieval_at?;
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        let interval = self.config.polling_interval();
        (elapsed < interval).then(|| interval - elapsed)
    }
}

/// Keep the last occurrence of each id, in feed order.
fn dedupe_last_wins<T: FactEntity>(data: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(data.len());
    let mut out: Vec<T> = data
        .into_iter()
        .rev()
        .filter(|item| seen.insert(item.id().to_string()))
        .collect();
    out.reverse();
    out
}
