//! Pre-flight update policy.
//!
//! Decides whether a repository is synced at all in this run. A repository
//! with an `interval` is skipped while its last fetch (the modification time
//! of `FETCH_HEAD`) is more recent than the interval, unless it is forced.
//! The policy never influences how a sync is performed.

use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::models::RepositorySpec;

/// Outcome of the pre-flight check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip { next_due: DateTime<Utc> },
}

/// Interval-based throttling with a force override.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdatePolicy {
    /// Force every repository regardless of its own setting.
    pub force_all: bool,
}

impl UpdatePolicy {
    pub fn new(force_all: bool) -> Self {
        Self { force_all }
    }

    pub fn decide(&self, spec: &RepositorySpec, now: DateTime<Utc>) -> Decision {
        if self.force_all || spec.force_update {
            return Decision::Run;
        }
        let Some(interval) = spec.min_interval else {
            return Decision::Run;
        };
        let Some(last_fetch) = last_fetch_time(&spec.local_path) else {
            return Decision::Run;
        };
        let Ok(interval) = ChronoDuration::from_std(interval) else {
            return Decision::Run;
        };

        let next_due = last_fetch + interval;
        if next_due > now {
            debug!(repo = %spec.name, next_due = %next_due.to_rfc3339(), "update not due yet");
            Decision::Skip { next_due }
        } else {
            Decision::Run
        }
    }
}

/// Modification time of `<path>/.git/FETCH_HEAD`, if present.
fn last_fetch_time(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path.join(".git").join("FETCH_HEAD"))
        .and_then(|m| m.modified())
        .ok()?;
    Some(DateTime::<Utc>::from(modified))
}
