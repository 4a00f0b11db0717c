//! gitupdater core library.
//!
//! Keeps a set of local git working copies in sync with their upstreams:
//! configuration loading, the `git2`-backed repository store, merge
//! analysis, the per-repository sync state machine, and the driver that runs
//! it across the whole set.

pub mod config;
pub mod errors;
pub mod git;
pub mod models;
pub mod policy;
pub mod repository_set;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::UpdaterConfig;
pub use errors::{ConfigError, CoreError, SyncError};
pub use git::{GitStore, RepositoryStore};
pub use models::{RepositorySpec, SyncOutcome};
pub use repository_set::{RepositorySet, RunOptions, RunReport};
pub use sync_engine::SyncEngine;
