//! Domain model types shared by the store, the analyzer and the engine.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use git2::Oid;

use crate::errors::SyncError;

// ---------------------------------------------------------------------------
// Repository spec
// ---------------------------------------------------------------------------

pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_BRANCH: &str = "master";

/// One managed repository, as loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositorySpec {
    /// Section name in the config file.
    pub name: String,
    /// Working copy location (`<root>/<name>`).
    pub local_path: PathBuf,
    pub remote_url: String,
    pub remote_name: String,
    pub branch: String,
    /// Bypass the pre-flight update policy for this repository.
    pub force_update: bool,
    /// Minimum time between fetches; `None` means always sync.
    pub min_interval: Option<Duration>,
}

impl RepositorySpec {
    /// A spec with default remote, branch and policy settings.
    pub fn new(
        name: impl Into<String>,
        local_path: impl Into<PathBuf>,
        remote_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            local_path: local_path.into(),
            remote_url: remote_url.into(),
            remote_name: DEFAULT_REMOTE.into(),
            branch: DEFAULT_BRANCH.into(),
            force_update: false,
            min_interval: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_remote(mut self, remote_name: impl Into<String>) -> Self {
        self.remote_name = remote_name.into();
        self
    }

    /// `refs/heads/<branch>`
    pub fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    /// `refs/remotes/<remote>/<branch>`
    pub fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote_name, self.branch)
    }
}

// ---------------------------------------------------------------------------
// Ref pointer
// ---------------------------------------------------------------------------

/// Content-addressed identifier of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefPointer(Oid);

impl RefPointer {
    pub fn oid(&self) -> Oid {
        self.0
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.0.to_string();
        s.truncate(8);
        s
    }
}

impl From<Oid> for RefPointer {
    fn from(oid: Oid) -> Self {
        Self(oid)
    }
}

impl std::fmt::Display for RefPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Merge analysis
// ---------------------------------------------------------------------------

/// Relationship between a local and a remote branch tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAnalysisResult {
    /// Nothing to do: tips are equal or local already contains remote.
    UpToDate,
    /// Remote descends from local.
    FastForward { target: RefPointer },
    /// Divergent histories with a common ancestor.
    Normal {
        local_tip: RefPointer,
        remote_tip: RefPointer,
    },
    /// No common ancestor.
    Unrelated,
}

impl std::fmt::Display for MergeAnalysisResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up_to_date"),
            Self::FastForward { .. } => write!(f, "fast_forward"),
            Self::Normal { .. } => write!(f, "normal"),
            Self::Unrelated => write!(f, "unrelated"),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of one repository's sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Cloned,
    AlreadyUpToDate,
    FastForwarded,
    Merged { commit_id: RefPointer },
    ConflictDetected { paths: BTreeSet<PathBuf> },
    /// Not synced this run because of the update interval.
    Skipped { next_due: DateTime<Utc> },
    Failed { reason: SyncError },
}

impl SyncOutcome {
    /// `true` for outcomes that fail the run.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::ConflictDetected { .. })
    }

    /// Short kind name used for counters and summary lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cloned => "cloned",
            Self::AlreadyUpToDate => "up_to_date",
            Self::FastForwarded => "fast_forwarded",
            Self::Merged { .. } => "merged",
            Self::ConflictDetected { .. } => "conflict",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloned => write!(f, "cloned"),
            Self::AlreadyUpToDate => write!(f, "already up to date"),
            Self::FastForwarded => write!(f, "fast-forwarded"),
            Self::Merged { commit_id } => write!(f, "merged ({})", commit_id.short()),
            Self::ConflictDetected { paths } => {
                let list: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                write!(f, "conflicts in {}", list.join(", "))
            }
            Self::Skipped { next_due } => {
                write!(f, "skipped (next update due {})", next_due.to_rfc3339())
            }
            Self::Failed { reason } => write!(f, "failed [{}]: {}", reason.kind(), reason),
        }
    }
}
