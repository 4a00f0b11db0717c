//! Error types for the gitupdater core library.
//!
//! Per-repository failures are [`SyncError`]s and never escape the repository
//! they belong to. [`ConfigError`]s are global and abort a run before any
//! repository is touched. [`CoreError`] unifies both for callers that want a
//! single error type.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// A failure scoped to a single repository.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Cloning the remote failed (network, auth, bad URL, unknown branch).
    #[error("clone of '{url}' failed: {detail}")]
    CloneError { url: String, detail: String },

    /// Local repository metadata exists but could not be opened.
    #[error("could not open repository at '{path}': {detail}")]
    OpenError { path: String, detail: String },

    /// Fetching from the configured remote failed.
    #[error("fetch from remote '{remote}' failed: {detail}")]
    FetchError { remote: String, detail: String },

    /// A branch or tracking ref does not exist.
    #[error("ref not found: {0}")]
    NoSuchRef(String),

    /// Local and remote tips share no history.
    #[error("local {local} and remote {remote} have no common ancestor")]
    UnrelatedHistories { local: String, remote: String },

    /// A three-way merge produced conflicting paths; nothing was committed.
    #[error("merge conflict in {}", format_paths(.paths))]
    MergeConflict { paths: BTreeSet<PathBuf> },

    /// Leftover operation metadata (e.g. an interrupted merge) was found.
    #[error("repository at '{path}' is in state '{state}', manual intervention required")]
    InconsistentState { path: String, state: String },

    /// Checkout or ref update was refused.
    #[error("working tree update failed: {detail}")]
    WorktreeError { detail: String },

    /// The repository did not finish within the configured time.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// A logic defect. Never expected under a correct implementation.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl SyncError {
    /// Stable snake_case name of the error kind, used in summary lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CloneError { .. } => "clone_error",
            Self::OpenError { .. } => "open_error",
            Self::FetchError { .. } => "fetch_error",
            Self::NoSuchRef(_) => "no_such_ref",
            Self::UnrelatedHistories { .. } => "unrelated_histories",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::InconsistentState { .. } => "inconsistent_state",
            Self::WorktreeError { .. } => "worktree_error",
            Self::Timeout { .. } => "timeout",
            Self::InternalError(_) => "internal_error",
        }
    }
}

fn format_paths(paths: &BTreeSet<PathBuf>) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// INI parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required key is absent or empty.
    #[error("section [{section}] is missing required field '{field}'")]
    MissingField { section: String, field: String },

    /// A config value is invalid.
    #[error("invalid value for '{field}' in section [{section}]: {detail}")]
    InvalidValue {
        section: String,
        field: String,
        detail: String,
    },

    /// The same section name appears more than once.
    #[error("duplicate repository section [{0}]")]
    DuplicateSection(String),

    /// Two sections resolve to the same working copy.
    #[error("sections [{first}] and [{second}] both resolve to '{path}'")]
    DuplicateLocalPath {
        path: String,
        first: String,
        second: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
