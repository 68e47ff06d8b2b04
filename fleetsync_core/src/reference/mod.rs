//! Reference data (devices, diagnostics) mirrored in memory and propagated to the store.

pub mod cacher;
pub mod service;

pub use cacher::{CacheOperation, CacheSnapshot, ReferenceObjectCacher, UpdateOutcome};
pub use service::ReferenceCacheService;
