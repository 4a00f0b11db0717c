//! Local working-copy operations via `git2`.
//!
//! [`RepositoryStore`] is the seam between the sync engine and the on-disk
//! repository; [`GitStore`] is the `git2` implementation used in production
//! and in the integration tests.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Cred, CredentialType, ErrorCode, FetchOptions, Index, RemoteCallbacks, Repository,
    RepositoryState, Signature,
};
use tracing::{debug, info, instrument, warn};

use crate::errors::SyncError;
use crate::git::analysis::CommitGraph;
use crate::models::{RefPointer, RepositorySpec};

/// Default bound on a single clone or fetch.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(120);

const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

/// Operations the sync engine needs from a local repository.
pub trait RepositoryStore: Send + Sync {
    type Handle: CommitGraph + Send;

    /// Whether repository metadata exists at `path`.
    fn has_metadata(&self, path: &Path) -> bool;

    /// Open the working copy, or clone it when no metadata exists.
    fn open_or_clone(&self, spec: &RepositorySpec) -> Result<Self::Handle, SyncError>;

    /// `true` if the handle was produced by a clone during this run.
    fn is_newly_cloned(&self, handle: &Self::Handle) -> bool;

    /// Fail with `InconsistentState` if an operation was left in progress.
    fn ensure_clean(&self, handle: &Self::Handle) -> Result<(), SyncError>;

    fn fetch(&self, handle: &Self::Handle, remote_name: &str) -> Result<(), SyncError>;

    fn local_branch_tip(&self, handle: &Self::Handle, branch: &str)
        -> Result<RefPointer, SyncError>;

    fn remote_branch_tip(
        &self,
        handle: &Self::Handle,
        remote_name: &str,
        branch: &str,
    ) -> Result<RefPointer, SyncError>;

    /// Move the working tree and the branch ref to `target`.
    fn fast_forward(
        &self,
        handle: &Self::Handle,
        branch: &str,
        target: RefPointer,
    ) -> Result<(), SyncError>;

    /// Merge `remote_tip` into `local_tip` and commit the result on `branch`.
    ///
    /// Returns `MergeConflict` without touching the repository when the
    /// three-way merge has conflicting paths.
    fn create_merge_commit(
        &self,
        handle: &Self::Handle,
        branch: &str,
        local_tip: RefPointer,
        remote_tip: RefPointer,
    ) -> Result<RefPointer, SyncError>;
}

/// Runtime binding to one working copy.
pub struct RepositoryHandle {
    repo: Repository,
    metadata_path: PathBuf,
    is_newly_cloned: bool,
}

impl RepositoryHandle {
    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    pub fn is_newly_cloned(&self) -> bool {
        self.is_newly_cloned
    }

    fn workdir_display(&self) -> String {
        self.repo
            .workdir()
            .unwrap_or_else(|| self.repo.path())
            .display()
            .to_string()
    }
}

impl std::fmt::Debug for RepositoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryHandle")
            .field("metadata_path", &self.metadata_path)
            .field("is_newly_cloned", &self.is_newly_cloned)
            .finish()
    }
}

impl CommitGraph for RepositoryHandle {
    fn is_descendant_of(
        &self,
        commit: RefPointer,
        ancestor: RefPointer,
    ) -> Result<bool, SyncError> {
        self.repo
            .graph_descendant_of(commit.oid(), ancestor.oid())
            .map_err(|e| read_error(self, e))
    }

    fn merge_base(&self, a: RefPointer, b: RefPointer) -> Result<Option<RefPointer>, SyncError> {
        match self.repo.merge_base(a.oid(), b.oid()) {
            Ok(oid) => Ok(Some(oid.into())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(read_error(self, e)),
        }
    }
}

/// Tunables for [`GitStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Upper bound for a clone or fetch.
    pub network_timeout: Duration,
    /// Committer used for merge commits when the repository has no
    /// `user.name` / `user.email` configured.
    pub fallback_name: String,
    pub fallback_email: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            fallback_name: "gitupdater".into(),
            fallback_email: "gitupdater@localhost".into(),
        }
    }
}

/// [`RepositoryStore`] backed by `git2`.
#[derive(Debug, Clone)]
pub struct GitStore {
    options: StoreOptions,
}

impl Default for GitStore {
    fn default() -> Self {
        Self::new(StoreOptions::default())
    }
}

impl GitStore {
    /// Create a store. Also sets libgit2's process-wide connect and read
    /// timeouts to `network_timeout`, so a server that accepts the
    /// connection and then goes silent cannot stall a clone or fetch.
    pub fn new(options: StoreOptions) -> Self {
        set_server_timeouts(options.network_timeout);
        Self { options }
    }

    /// Fetch options whose transfer callbacks abort once `deadline` passes.
    fn fetch_options<'cb>(&self, deadline: Instant) -> FetchOptions<'cb> {
        let mut callbacks = RemoteCallbacks::new();
        let mut attempts = 0usize;
        callbacks.credentials(move |url, username, allowed| {
            attempts += 1;
            if attempts > MAX_CREDENTIAL_ATTEMPTS {
                return Err(git2::Error::from_str("credentials rejected"));
            }
            if allowed.contains(CredentialType::SSH_KEY) {
                if let Some(user) = username {
                    return Cred::ssh_key_from_agent(user);
                }
            }
            if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                if let Ok(config) = git2::Config::open_default() {
                    return Cred::credential_helper(&config, url, username);
                }
            }
            Cred::default()
        });
        callbacks.transfer_progress(move |_| Instant::now() < deadline);
        callbacks.sideband_progress(move |_| Instant::now() < deadline);

        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks);
        fetch_opts
    }

    fn network_detail(&self, err: &git2::Error, deadline: Instant) -> String {
        if Instant::now() >= deadline {
            format!(
                "timed out after {}s",
                self.options.network_timeout.as_secs()
            )
        } else {
            err.message().to_string()
        }
    }

    fn signature(&self, repo: &Repository) -> Result<Signature<'static>, SyncError> {
        match repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Signature::now(&self.options.fallback_name, &self.options.fallback_email)
                .map_err(|e| SyncError::InternalError(format!("invalid fallback signature: {e}"))),
        }
    }

    /// Point `refs/heads/<branch>` and HEAD at `target`. On failure, the
    /// working tree is restored to `previous`.
    fn advance_branch(
        &self,
        handle: &RepositoryHandle,
        branch: &str,
        target: git2::Oid,
        previous: Option<&git2::Tree<'_>>,
        reflog: &str,
    ) -> Result<(), SyncError> {
        let repo = &handle.repo;
        let refname = format!("refs/heads/{}", branch);
        let result = repo
            .reference(&refname, target, true, reflog)
            .and_then(|_| repo.set_head(&refname));

        if let Err(e) = result {
            warn!(error = %e, branch, "ref update failed, restoring previous tree");
            if let Some(tree) = previous {
                if let Err(restore) =
                    repo.checkout_tree(tree.as_object(), Some(CheckoutBuilder::new().force()))
                {
                    warn!(error = %restore, "could not restore previous tree");
                }
            }
            return Err(worktree_error(e));
        }
        Ok(())
    }
}

impl RepositoryStore for GitStore {
    type Handle = RepositoryHandle;

    fn has_metadata(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }

    #[instrument(skip(self, spec), fields(repo = %spec.name))]
    fn open_or_clone(&self, spec: &RepositorySpec) -> Result<RepositoryHandle, SyncError> {
        let path = &spec.local_path;

        if self.has_metadata(path) {
            info!(path = %path.display(), "found repository");
            let repo = Repository::open(path).map_err(|e| SyncError::OpenError {
                path: path.display().to_string(),
                detail: e.message().to_string(),
            })?;
            return Ok(RepositoryHandle {
                metadata_path: repo.path().to_path_buf(),
                repo,
                is_newly_cloned: false,
            });
        }

        info!(path = %path.display(), url = %spec.remote_url, branch = %spec.branch, "cloning repository");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::CloneError {
                url: spec.remote_url.clone(),
                detail: format!("cannot create '{}': {}", parent.display(), e),
            })?;
        }

        let deadline = Instant::now() + self.options.network_timeout;
        let remote_name = spec.remote_name.clone();
        let mut builder = RepoBuilder::new();
        builder
            .branch(&spec.branch)
            .fetch_options(self.fetch_options(deadline))
            .remote_create(move |repo, _name, url| repo.remote(&remote_name, url));

        let repo = builder
            .clone(&spec.remote_url, path)
            .map_err(|e| SyncError::CloneError {
                url: spec.remote_url.clone(),
                detail: self.network_detail(&e, deadline),
            })?;
        info!("clone completed");

        Ok(RepositoryHandle {
            metadata_path: repo.path().to_path_buf(),
            repo,
            is_newly_cloned: true,
        })
    }

    fn is_newly_cloned(&self, handle: &RepositoryHandle) -> bool {
        handle.is_newly_cloned
    }

    fn ensure_clean(&self, handle: &RepositoryHandle) -> Result<(), SyncError> {
        match handle.repo.state() {
            RepositoryState::Clean => Ok(()),
            state => Err(SyncError::InconsistentState {
                path: handle.workdir_display(),
                state: format!("{:?}", state).to_lowercase(),
            }),
        }
    }

    #[instrument(skip(self, handle))]
    fn fetch(&self, handle: &RepositoryHandle, remote_name: &str) -> Result<(), SyncError> {
        info!(remote = remote_name, "fetching");
        let mut remote = handle
            .repo
            .find_remote(remote_name)
            .map_err(|e| SyncError::FetchError {
                remote: remote_name.to_string(),
                detail: e.message().to_string(),
            })?;

        let deadline = Instant::now() + self.options.network_timeout;
        let mut fetch_opts = self.fetch_options(deadline);
        remote
            .fetch(&[] as &[&str], Some(&mut fetch_opts), None)
            .map_err(|e| SyncError::FetchError {
                remote: remote_name.to_string(),
                detail: self.network_detail(&e, deadline),
            })?;

        let stats = remote.stats();
        debug!(
            objects = stats.received_objects(),
            bytes = stats.received_bytes(),
            "fetch completed"
        );
        Ok(())
    }

    fn local_branch_tip(
        &self,
        handle: &RepositoryHandle,
        branch: &str,
    ) -> Result<RefPointer, SyncError> {
        resolve_commit(handle, &format!("refs/heads/{}", branch))
    }

    fn remote_branch_tip(
        &self,
        handle: &RepositoryHandle,
        remote_name: &str,
        branch: &str,
    ) -> Result<RefPointer, SyncError> {
        resolve_commit(handle, &format!("refs/remotes/{}/{}", remote_name, branch))
    }

    #[instrument(skip(self, handle), fields(target = %target.short()))]
    fn fast_forward(
        &self,
        handle: &RepositoryHandle,
        branch: &str,
        target: RefPointer,
    ) -> Result<(), SyncError> {
        let repo = &handle.repo;
        let commit = repo.find_commit(target.oid()).map_err(worktree_error)?;
        let previous = repo.head().ok().and_then(|h| h.peel_to_tree().ok());

        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().safe()))
            .map_err(worktree_error)?;

        let reflog = format!("gitupdater: fast-forward to {}", target);
        self.advance_branch(handle, branch, target.oid(), previous.as_ref(), &reflog)?;

        info!(branch, "fast-forwarded");
        Ok(())
    }

    #[instrument(skip(self, handle), fields(local = %local_tip.short(), remote = %remote_tip.short()))]
    fn create_merge_commit(
        &self,
        handle: &RepositoryHandle,
        branch: &str,
        local_tip: RefPointer,
        remote_tip: RefPointer,
    ) -> Result<RefPointer, SyncError> {
        let repo = &handle.repo;
        let local_commit = repo.find_commit(local_tip.oid()).map_err(|e| read_error(handle, e))?;
        let remote_commit = repo
            .find_commit(remote_tip.oid())
            .map_err(|e| read_error(handle, e))?;

        let mut index = repo
            .merge_commits(&local_commit, &remote_commit, None)
            .map_err(worktree_error)?;

        if index.has_conflicts() {
            let paths = conflict_paths(&index)?;
            warn!(count = paths.len(), "merge produced conflicts, nothing committed");
            return Err(SyncError::MergeConflict { paths });
        }

        let tree_oid = index.write_tree_to(repo).map_err(worktree_error)?;
        let tree = repo.find_tree(tree_oid).map_err(worktree_error)?;
        let signature = self.signature(repo)?;
        let message = format!("Merge {} into {}", remote_tip.short(), branch);
        let commit_oid = repo
            .commit(
                None,
                &signature,
                &signature,
                &message,
                &tree,
                &[&local_commit, &remote_commit],
            )
            .map_err(worktree_error)?;

        let previous = local_commit.tree().ok();
        repo.checkout_tree(tree.as_object(), Some(CheckoutBuilder::new().safe()))
            .map_err(worktree_error)?;

        let reflog = format!("gitupdater: merge {}", remote_tip);
        self.advance_branch(handle, branch, commit_oid, previous.as_ref(), &reflog)?;

        repo.cleanup_state().map_err(worktree_error)?;
        info!(commit = %commit_oid, "created merge commit");
        Ok(commit_oid.into())
    }
}

fn set_server_timeouts(timeout: Duration) {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: each call writes one integer in libgit2's global settings,
    // read by sockets as they are opened. A racing socket sees either value.
    let result = unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis)
            .and_then(|_| git2::opts::set_server_timeout_in_milliseconds(millis))
    };
    match result {
        Ok(()) => debug!(timeout_ms = millis, "server timeouts configured"),
        Err(e) => warn!(error = %e, "could not set server timeouts"),
    }
}

fn resolve_commit(handle: &RepositoryHandle, refname: &str) -> Result<RefPointer, SyncError> {
    let reference = match handle.repo.find_reference(refname) {
        Ok(r) => r,
        Err(e) if e.code() == ErrorCode::NotFound => {
            return Err(SyncError::NoSuchRef(refname.to_string()))
        }
        Err(e) => return Err(read_error(handle, e)),
    };
    let commit = reference
        .peel_to_commit()
        .map_err(|e| read_error(handle, e))?;
    Ok(commit.id().into())
}

fn conflict_paths(index: &Index) -> Result<BTreeSet<PathBuf>, SyncError> {
    let mut paths = BTreeSet::new();
    for conflict in index.conflicts().map_err(worktree_error)? {
        let conflict = conflict.map_err(worktree_error)?;
        let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
        if let Some(entry) = entry {
            paths.insert(PathBuf::from(
                String::from_utf8_lossy(&entry.path).into_owned(),
            ));
        }
    }
    Ok(paths)
}

fn read_error(handle: &RepositoryHandle, err: git2::Error) -> SyncError {
    SyncError::OpenError {
        path: handle.workdir_display(),
        detail: err.message().to_string(),
    }
}

fn worktree_error(err: git2::Error) -> SyncError {
    let detail = if err.code() == ErrorCode::Conflict {
        format!("local changes would be overwritten: {}", err.message())
    } else {
        err.message().to_string()
    };
    SyncError::WorktreeError { detail }
}
