//! Shared configuration types for the Quill indexer.
//!
//! Kept in a separate crate so that the engine core, the public API layer
//! and the daemon binary can all depend on the same configuration surface
//! without pulling in the storage stack.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub(crate) mod config;

pub use config::{DatabaseConfig, DatabaseSize, IndexerConfig, SyncMode};
