//! Classification of a local/remote branch tip pair.

use tracing::debug;

use crate::errors::SyncError;
use crate::models::{MergeAnalysisResult, RefPointer};

/// Ancestry queries the analyzer needs.
pub trait CommitGraph {
    /// `true` if `ancestor` is reachable from `commit` through parent links.
    /// A commit is not its own descendant.
    fn is_descendant_of(&self, commit: RefPointer, ancestor: RefPointer)
        -> Result<bool, SyncError>;

    /// Best common ancestor of `a` and `b`, if any.
    fn merge_base(&self, a: RefPointer, b: RefPointer) -> Result<Option<RefPointer>, SyncError>;
}

/// Decide how `remote` should be integrated into `local`.
///
/// Checks run in priority order: equal tips, fast-forward, local ahead,
/// shared ancestor, unrelated. Never writes.
pub fn analyze<G>(
    local: RefPointer,
    remote: RefPointer,
    graph: &G,
) -> Result<MergeAnalysisResult, SyncError>
where
    G: CommitGraph + ?Sized,
{
    let result = if local == remote {
        MergeAnalysisResult::UpToDate
    } else if graph.is_descendant_of(remote, local)? {
        MergeAnalysisResult::FastForward { target: remote }
    } else if graph.is_descendant_of(local, remote)? {
        MergeAnalysisResult::UpToDate
    } else if graph.merge_base(local, remote)?.is_some() {
        MergeAnalysisResult::Normal {
            local_tip: local,
            remote_tip: remote,
        }
    } else {
        MergeAnalysisResult::Unrelated
    };

    debug!(local = %local.short(), remote = %remote.short(), %result, "merge analysis");
    Ok(result)
}
