//! Incremental fact feeds with a resumable cursor.

pub mod puller;

pub use puller::{FeedCursorState, FeedPuller, PollOutcome};
