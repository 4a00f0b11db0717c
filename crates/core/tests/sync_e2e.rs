//! End-to-end tests for the sync engine and the repository set.
//!
//! Every test builds a real upstream repository with `git2` inside a
//! `TempDir` and syncs working copies from it through its filesystem path.
//! No network I/O.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use git2::{Oid, Repository, RepositoryInitOptions, RepositoryState, Signature};
use tempfile::TempDir;

use gitupdater_core::errors::SyncError;
use gitupdater_core::git::GitStore;
use gitupdater_core::models::{RepositorySpec, SyncOutcome};
use gitupdater_core::repository_set::{RepositorySet, RunOptions};
use gitupdater_core::sync_engine::SyncEngine;

// ===========================================================================
// Helpers
// ===========================================================================

/// Create a non-bare upstream repository on `master` with one commit.
fn init_upstream(path: &Path) -> Repository {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("master");
    let repo = Repository::init_opts(path, &opts).unwrap();
    commit_file(&repo, "README", "hello\n", "initial");
    repo
}

/// Write `content` to `file` in the working tree and commit it on HEAD.
fn commit_file(repo: &Repository, file: &str, content: &str, message: &str) -> Oid {
    let workdir = repo.workdir().unwrap();
    let full = workdir.join(file);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&full, content).unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(Path::new(file)).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("Test", "test@test.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
}

/// Point `refs/heads/master` of `repo` at a new root commit.
fn replace_with_orphan(repo: &Repository) -> Oid {
    let blob = repo.blob(b"unrelated\n").unwrap();
    let mut builder = repo.treebuilder(None).unwrap();
    builder.insert("other.txt", blob, 0o100644).unwrap();
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    let sig = Signature::now("Test", "test@test.com").unwrap();
    let oid = repo
        .commit(None, &sig, &sig, "orphan", &tree, &[])
        .unwrap();
    repo.reference("refs/heads/master", oid, true, "orphan")
        .unwrap();
    oid
}

fn branch_tip(path: &Path, branch: &str) -> Oid {
    Repository::open(path)
        .unwrap()
        .find_reference(&format!("refs/heads/{}", branch))
        .unwrap()
        .target()
        .unwrap()
}

struct Fixture {
    upstream: Repository,
    root: PathBuf,
    _dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let upstream = init_upstream(&dir.path().join("upstream"));
        let root = dir.path().join("work");
        Self {
            upstream,
            root,
            _dir: dir,
        }
    }

    fn url(&self) -> String {
        self.upstream.workdir().unwrap().display().to_string()
    }

    fn spec(&self, name: &str) -> RepositorySpec {
        RepositorySpec::new(name, self.root.join(name), self.url())
    }

    fn upstream_tip(&self) -> Oid {
        self.upstream.head().unwrap().target().unwrap()
    }
}

fn engine() -> SyncEngine<GitStore> {
    SyncEngine::new(Arc::new(GitStore::default()))
}

// ===========================================================================
// Single repository
// ===========================================================================

#[test]
fn test_clone_bootstrap() {
    let fx = Fixture::new();
    let spec = fx.spec("tools");

    assert_eq!(engine().sync(&spec), SyncOutcome::Cloned);
    assert_eq!(branch_tip(&spec.local_path, "master"), fx.upstream_tip());
    assert!(spec.local_path.join("README").exists());
}

#[test]
fn test_idempotent_when_current() {
    let fx = Fixture::new();
    let spec = fx.spec("tools");
    let engine = engine();
    assert_eq!(engine.sync(&spec), SyncOutcome::Cloned);

    let before = branch_tip(&spec.local_path, "master");
    assert_eq!(engine.sync(&spec), SyncOutcome::AlreadyUpToDate);
    assert_eq!(engine.sync(&spec), SyncOutcome::AlreadyUpToDate);
    assert_eq!(branch_tip(&spec.local_path, "master"), before);
    assert_eq!(
        std::fs::read_to_string(spec.local_path.join("README")).unwrap(),
        "hello\n"
    );
}

#[test]
fn test_fast_forward() {
    let fx = Fixture::new();
    let spec = fx.spec("tools");
    let engine = engine();
    engine.sync(&spec);

    let remote_tip = commit_file(&fx.upstream, "src/new.rs", "fn main() {}\n", "add new");

    assert_eq!(engine.sync(&spec), SyncOutcome::FastForwarded);
    assert_eq!(branch_tip(&spec.local_path, "master"), remote_tip);
    assert_eq!(
        std::fs::read_to_string(spec.local_path.join("src/new.rs")).unwrap(),
        "fn main() {}\n"
    );
}

#[test]
fn test_merge_non_overlapping_changes() {
    let fx = Fixture::new();
    let spec = fx.spec("tools");
    let engine = engine();
    engine.sync(&spec);

    let local_repo = Repository::open(&spec.local_path).unwrap();
    let local_tip = commit_file(&local_repo, "local.txt", "mine\n", "local change");
    let remote_tip = commit_file(&fx.upstream, "upstream.txt", "theirs\n", "upstream change");

    let commit_id = match engine.sync(&spec) {
        SyncOutcome::Merged { commit_id } => commit_id,
        other => panic!("expected merge, got {:?}", other),
    };

    let merged = local_repo.find_commit(commit_id.oid()).unwrap();
    let parents: Vec<Oid> = merged.parent_ids().collect();
    assert_eq!(parents, vec![local_tip, remote_tip]);
    assert_eq!(branch_tip(&spec.local_path, "master"), commit_id.oid());
    assert!(spec.local_path.join("local.txt").exists());
    assert!(spec.local_path.join("upstream.txt").exists());
    assert_eq!(local_repo.state(), RepositoryState::Clean);

    // Local is now ahead of remote: nothing to do.
    assert_eq!(engine.sync(&spec), SyncOutcome::AlreadyUpToDate);
}

#[test]
fn test_conflict_leaves_branch_and_state_untouched() {
    let fx = Fixture::new();
    commit_file(&fx.upstream, "shared.txt", "base\n", "add shared");
    let spec = fx.spec("tools");
    let engine = engine();
    engine.sync(&spec);

    let local_repo = Repository::open(&spec.local_path).unwrap();
    let local_tip = commit_file(&local_repo, "shared.txt", "local edit\n", "local");
    commit_file(&fx.upstream, "shared.txt", "remote edit\n", "remote");

    let expected: BTreeSet<PathBuf> = [PathBuf::from("shared.txt")].into_iter().collect();
    assert_eq!(
        engine.sync(&spec),
        SyncOutcome::ConflictDetected { paths: expected }
    );
    assert_eq!(branch_tip(&spec.local_path, "master"), local_tip);
    assert_eq!(local_repo.state(), RepositoryState::Clean);
    assert_eq!(
        std::fs::read_to_string(spec.local_path.join("shared.txt")).unwrap(),
        "local edit\n"
    );
}

#[test]
fn test_unrelated_histories_fail() {
    let fx = Fixture::new();
    let spec = fx.spec("tools");
    let engine = engine();
    engine.sync(&spec);
    let before = branch_tip(&spec.local_path, "master");

    replace_with_orphan(&fx.upstream);

    match engine.sync(&spec) {
        SyncOutcome::Failed {
            reason: SyncError::UnrelatedHistories { .. },
        } => {}
        other => panic!("expected unrelated histories, got {:?}", other),
    }
    assert_eq!(branch_tip(&spec.local_path, "master"), before);
}

#[test]
fn test_interrupted_merge_is_inconsistent_state() {
    let fx = Fixture::new();
    let spec = fx.spec("tools");
    let engine = engine();
    engine.sync(&spec);

    let tip = branch_tip(&spec.local_path, "master");
    std::fs::write(
        spec.local_path.join(".git").join("MERGE_HEAD"),
        format!("{}\n", tip),
    )
    .unwrap();
    commit_file(&fx.upstream, "later.txt", "x\n", "later");

    let outcome = engine.sync(&spec);
    assert!(matches!(
        outcome,
        SyncOutcome::Failed {
            reason: SyncError::InconsistentState { .. }
        }
    ));
    assert_eq!(branch_tip(&spec.local_path, "master"), tip);
}

#[test]
fn test_missing_remote_branch_is_no_such_ref() {
    let fx = Fixture::new();
    let spec = fx.spec("tools");
    let engine = engine();
    engine.sync(&spec);

    let spec = spec.with_branch("does-not-exist");
    assert_eq!(
        engine.sync(&spec),
        SyncOutcome::Failed {
            reason: SyncError::NoSuchRef("refs/remotes/origin/does-not-exist".into())
        }
    );
}

#[test]
fn test_absent_local_branch_is_created() {
    let fx = Fixture::new();
    let spec = fx.spec("tools");
    let engine = engine();
    engine.sync(&spec);

    let master = fx.upstream.head().unwrap().peel_to_commit().unwrap();
    fx.upstream.branch("develop", &master, false).unwrap();
    fx.upstream.set_head("refs/heads/develop").unwrap();
    let develop_tip = commit_file(&fx.upstream, "dev.txt", "dev\n", "on develop");

    let spec = spec.with_branch("develop");
    assert_eq!(engine.sync(&spec), SyncOutcome::FastForwarded);
    assert_eq!(branch_tip(&spec.local_path, "develop"), develop_tip);
    assert!(spec.local_path.join("dev.txt").exists());
}

#[test]
fn test_dirty_worktree_blocks_fast_forward() {
    let fx = Fixture::new();
    let spec = fx.spec("tools");
    let engine = engine();
    engine.sync(&spec);
    let before = branch_tip(&spec.local_path, "master");

    commit_file(&fx.upstream, "README", "upstream edit\n", "edit readme");
    std::fs::write(spec.local_path.join("README"), "uncommitted\n").unwrap();

    match engine.sync(&spec) {
        SyncOutcome::Failed {
            reason: SyncError::WorktreeError { .. },
        } => {}
        other => panic!("expected worktree error, got {:?}", other),
    }
    assert_eq!(branch_tip(&spec.local_path, "master"), before);
    assert_eq!(
        std::fs::read_to_string(spec.local_path.join("README")).unwrap(),
        "uncommitted\n"
    );
}

#[test]
fn test_custom_remote_name() {
    let fx = Fixture::new();
    let spec = fx.spec("tools").with_remote("upstream");
    let engine = engine();

    assert_eq!(engine.sync(&spec), SyncOutcome::Cloned);
    let repo = Repository::open(&spec.local_path).unwrap();
    assert!(repo.find_remote("upstream").is_ok());

    let tip = commit_file(&fx.upstream, "x.txt", "x\n", "x");
    assert_eq!(engine.sync(&spec), SyncOutcome::FastForwarded);
    assert_eq!(branch_tip(&spec.local_path, "master"), tip);
}

// ===========================================================================
// Repository set
// ===========================================================================

#[tokio::test]
async fn test_failure_is_isolated() {
    let fx = Fixture::new();
    let mut broken = fx.spec("broken");
    broken.remote_url = fx.root.join("no-such-upstream").display().to_string();
    let good = fx.spec("good");

    let set = RepositorySet::new(
        vec![broken, good],
        Arc::new(GitStore::default()),
        RunOptions::default(),
    )
    .unwrap();
    let report = set.run().await;

    let names: Vec<_> = report.repositories.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["broken", "good"]);
    assert!(matches!(
        report.repositories[0].outcome,
        SyncOutcome::Failed {
            reason: SyncError::CloneError { .. }
        }
    ));
    assert_eq!(report.repositories[1].outcome, SyncOutcome::Cloned);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_parallel_jobs_preserve_order() {
    let fx = Fixture::new();
    let specs: Vec<_> = ["c", "a", "b"].iter().map(|n| fx.spec(n)).collect();
    let options = RunOptions {
        jobs: 3,
        ..Default::default()
    };

    let set = RepositorySet::new(specs, Arc::new(GitStore::default()), options).unwrap();
    let report = set.run().await;

    let names: Vec<_> = report.repositories.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["c", "a", "b"]);
    assert!(report.is_success());
    assert_eq!(report.counts()["cloned"], 3);
}

#[tokio::test]
async fn test_interval_skips_unless_forced() {
    let fx = Fixture::new();
    let mut spec = fx.spec("tools");
    let store = Arc::new(GitStore::default());

    // Clone, then fetch once so FETCH_HEAD exists.
    let set = RepositorySet::new(vec![spec.clone()], store.clone(), RunOptions::default()).unwrap();
    assert_eq!(set.run().await.repositories[0].outcome, SyncOutcome::Cloned);
    assert_eq!(
        set.run().await.repositories[0].outcome,
        SyncOutcome::AlreadyUpToDate
    );

    spec.min_interval = Some(Duration::from_secs(3600));
    let set = RepositorySet::new(vec![spec.clone()], store.clone(), RunOptions::default()).unwrap();
    let report = set.run().await;
    assert!(matches!(
        report.repositories[0].outcome,
        SyncOutcome::Skipped { .. }
    ));
    assert!(report.is_success());

    let forced = RunOptions {
        force: true,
        ..Default::default()
    };
    let set = RepositorySet::new(vec![spec], store, forced).unwrap();
    assert_eq!(
        set.run().await.repositories[0].outcome,
        SyncOutcome::AlreadyUpToDate
    );
}
