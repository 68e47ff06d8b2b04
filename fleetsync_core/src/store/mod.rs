//! Relational persistence. The core talks to it only through the seams in `crate::traits`.

pub mod sqlite;

pub use sqlite::SqliteSyncStore;
