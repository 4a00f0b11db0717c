//! Per-repository synchronization state machine.
//!
//! The [`SyncEngine`] drives one repository through
//!
//! ```text
//! Cloning -> Fetching -> Analyzing -> {FastForwarding | Merging | Idle}
//!         -> Done | Conflicted | Failed
//! ```
//!
//! starting in `Cloning` when no local metadata exists and in `Fetching`
//! otherwise. A fresh clone already sits at the remote tip, so it ends in
//! `Done` straight away. Every transition is checked against the table in
//! [`SyncState::can_transition_to`]; an illegal transition is an internal
//! error and fails the repository.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::errors::SyncError;
use crate::git::analysis::{analyze, CommitGraph};
use crate::git::store::RepositoryStore;
use crate::models::{MergeAnalysisResult, RefPointer, RepositorySpec, SyncOutcome};

// ---------------------------------------------------------------------------
// Sync state machine
// ---------------------------------------------------------------------------

/// States of a single repository sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Cloning,
    Fetching,
    Analyzing,
    FastForwarding,
    Merging,
    Idle,
    Done,
    Conflicted,
    Failed,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Conflicted | Self::Failed)
    }

    /// Legal transitions.
    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;
        match (self, next) {
            (Cloning, Fetching | Done | Failed) => true,
            (Fetching, Analyzing | Failed) => true,
            (Analyzing, FastForwarding | Merging | Idle | Failed) => true,
            (FastForwarding, Done | Failed) => true,
            (Merging, Done | Conflicted | Failed) => true,
            (Idle, Done | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloning => write!(f, "cloning"),
            Self::Fetching => write!(f, "fetching"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::FastForwarding => write!(f, "fast_forwarding"),
            Self::Merging => write!(f, "merging"),
            Self::Idle => write!(f, "idle"),
            Self::Done => write!(f, "done"),
            Self::Conflicted => write!(f, "conflicted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Current state of one run, owned by that run only.
struct SyncRun<'a> {
    repo: &'a str,
    state: SyncState,
}

impl<'a> SyncRun<'a> {
    fn new(repo: &'a str, initial: SyncState) -> Self {
        debug!(repo, state = %initial, "initial state");
        Self {
            repo,
            state: initial,
        }
    }

    fn advance(&mut self, next: SyncState) -> Result<(), SyncError> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InternalError(format!(
                "invalid sync state transition from {} to {}",
                self.state, next
            )));
        }
        info!(repo = self.repo, from = %self.state, to = %next, "state transition");
        self.state = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs the sync state machine against a [`RepositoryStore`].
pub struct SyncEngine<S: RepositoryStore> {
    store: Arc<S>,
}

impl<S: RepositoryStore> Clone for SyncEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: RepositoryStore> SyncEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Synchronize one repository. Never panics on repository errors; every
    /// failure is folded into the returned outcome.
    pub fn sync(&self, spec: &RepositorySpec) -> SyncOutcome {
        let initial = if self.store.has_metadata(&spec.local_path) {
            SyncState::Fetching
        } else {
            SyncState::Cloning
        };
        let mut run = SyncRun::new(&spec.name, initial);

        match self.drive(spec, &mut run) {
            Ok(outcome) => match run.advance(SyncState::Done) {
                Ok(()) => outcome,
                Err(e) => self.fail(spec, &mut run, e),
            },
            Err(SyncError::MergeConflict { paths }) => match run.advance(SyncState::Conflicted) {
                Ok(()) => {
                    warn!(repo = %spec.name, count = paths.len(), "merge conflicts, branch left unchanged");
                    SyncOutcome::ConflictDetected { paths }
                }
                Err(e) => self.fail(spec, &mut run, e),
            },
            Err(e) => self.fail(spec, &mut run, e),
        }
    }

    fn fail(&self, spec: &RepositorySpec, run: &mut SyncRun<'_>, reason: SyncError) -> SyncOutcome {
        let at = run.state;
        if !at.is_terminal() {
            // Every non-terminal state may fail.
            let _ = run.advance(SyncState::Failed);
        }
        match &reason {
            SyncError::InternalError(detail) => error!(
                repo = %spec.name,
                path = %spec.local_path.display(),
                remote = %spec.remote_name,
                branch = %spec.branch,
                state = %at,
                detail = %detail,
                "internal error during sync"
            ),
            other => warn!(repo = %spec.name, state = %at, error = %other, "sync failed"),
        }
        SyncOutcome::Failed { reason }
    }

    fn drive(&self, spec: &RepositorySpec, run: &mut SyncRun<'_>) -> Result<SyncOutcome, SyncError> {
        // Cloning / opening
        let handle = self.store.open_or_clone(spec)?;
        if run.state == SyncState::Cloning {
            if self.store.is_newly_cloned(&handle) {
                return Ok(SyncOutcome::Cloned);
            }
            // Metadata appeared between the existence check and the open.
            run.advance(SyncState::Fetching)?;
        }

        // Fetching
        self.store.ensure_clean(&handle)?;
        self.store.fetch(&handle, &spec.remote_name)?;

        // Analyzing
        run.advance(SyncState::Analyzing)?;
        let remote = self
            .store
            .remote_branch_tip(&handle, &spec.remote_name, &spec.branch)?;
        let local = match self.store.local_branch_tip(&handle, &spec.branch) {
            Ok(tip) => Some(tip),
            Err(SyncError::NoSuchRef(refname)) => {
                info!(repo = %spec.name, %refname, "local branch absent, it will be created");
                None
            }
            Err(e) => return Err(e),
        };
        let analysis = match local {
            Some(local) => analyze(local, remote, &handle)?,
            None => MergeAnalysisResult::FastForward { target: remote },
        };

        match analysis {
            MergeAnalysisResult::UpToDate => {
                run.advance(SyncState::Idle)?;
                info!(repo = %spec.name, "already up to date");
                Ok(SyncOutcome::AlreadyUpToDate)
            }
            MergeAnalysisResult::FastForward { target } => {
                if target != remote {
                    return Err(SyncError::InternalError(format!(
                        "fast-forward target {} is not the observed remote tip {}",
                        target, remote
                    )));
                }
                run.advance(SyncState::FastForwarding)?;
                self.store.fast_forward(&handle, &spec.branch, target)?;
                self.verify_tip(&handle, spec, remote)?;
                Ok(SyncOutcome::FastForwarded)
            }
            MergeAnalysisResult::Normal {
                local_tip,
                remote_tip,
            } => {
                if Some(local_tip) != local || remote_tip != remote {
                    return Err(SyncError::InternalError(format!(
                        "merge tips {}/{} do not match observed tips",
                        local_tip, remote_tip
                    )));
                }
                run.advance(SyncState::Merging)?;
                let commit_id =
                    self.store
                        .create_merge_commit(&handle, &spec.branch, local_tip, remote_tip)?;
                self.verify_tip(&handle, spec, remote)?;
                Ok(SyncOutcome::Merged { commit_id })
            }
            MergeAnalysisResult::Unrelated => Err(SyncError::UnrelatedHistories {
                local: local.map(|l| l.to_string()).unwrap_or_default(),
                remote: remote.to_string(),
            }),
        }
    }

    /// After any write, the branch must contain the observed remote tip.
    fn verify_tip(
        &self,
        handle: &S::Handle,
        spec: &RepositorySpec,
        remote: RefPointer,
    ) -> Result<(), SyncError> {
        let tip = self.store.local_branch_tip(handle, &spec.branch)?;
        if tip == remote || handle.is_descendant_of(tip, remote)? {
            Ok(())
        } else {
            Err(SyncError::InternalError(format!(
                "branch '{}' at {} does not contain remote tip {}",
                spec.branch, tip, remote
            )))
        }
    }
}
