//! Git operations for gitupdater.

pub mod analysis;
pub mod store;

pub use analysis::{analyze, CommitGraph};
pub use store::{GitStore, RepositoryHandle, RepositoryStore, StoreOptions};
