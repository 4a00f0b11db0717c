//! Drives the [`SyncEngine`] across every configured repository.
//!
//! Repositories are independent: each runs on the blocking pool under its own
//! timeout, and a semaphore bounds how many run at once. With the default of
//! one job they are processed strictly in configuration order. The report
//! always lists outcomes in configuration order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{info, info_span, warn, Instrument, Span};

use crate::config::UpdaterConfig;
use crate::errors::{ConfigError, SyncError};
use crate::git::store::RepositoryStore;
use crate::models::{RepositorySpec, SyncOutcome};
use crate::policy::{Decision, UpdatePolicy};
use crate::sync_engine::SyncEngine;

/// Default upper bound for one repository's whole sync.
pub const DEFAULT_REPO_TIMEOUT: Duration = Duration::from_secs(300);

/// Run-wide settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of repositories synced concurrently.
    pub jobs: usize,
    /// Upper bound for one repository's sync.
    pub repo_timeout: Duration,
    /// Force every repository past the update policy.
    pub force: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            repo_timeout: DEFAULT_REPO_TIMEOUT,
            force: false,
        }
    }
}

/// Outcome of one repository within a run.
#[derive(Debug, Clone)]
pub struct RepositoryReport {
    pub name: String,
    pub path: PathBuf,
    pub outcome: SyncOutcome,
    pub elapsed: Duration,
}

/// Aggregate of a full pass over the repository set.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub repositories: Vec<RepositoryReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunReport {
    /// `true` unless some repository failed or hit conflicts.
    pub fn is_success(&self) -> bool {
        !self.repositories.iter().any(|r| r.outcome.is_failure())
    }

    /// Number of repositories per outcome kind.
    pub fn counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for report in &self.repositories {
            *counts.entry(report.outcome.kind()).or_insert(0) += 1;
        }
        counts
    }

    pub fn failures(&self) -> impl Iterator<Item = &RepositoryReport> {
        self.repositories.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn get(&self, name: &str) -> Option<&RepositoryReport> {
        self.repositories.iter().find(|r| r.name == name)
    }
}

/// The configured repositories plus the engine that syncs them.
pub struct RepositorySet<S: RepositoryStore + 'static> {
    specs: Vec<RepositorySpec>,
    engine: SyncEngine<S>,
    options: RunOptions,
}

impl<S: RepositoryStore + 'static> RepositorySet<S> {
    /// Build a set from already-parsed specs. Rejects two specs that share a
    /// working copy.
    pub fn new(
        specs: Vec<RepositorySpec>,
        store: Arc<S>,
        options: RunOptions,
    ) -> Result<Self, ConfigError> {
        let mut seen: HashMap<&PathBuf, &str> = HashMap::new();
        for spec in &specs {
            if let Some(first) = seen.insert(&spec.local_path, &spec.name) {
                return Err(ConfigError::DuplicateLocalPath {
                    path: spec.local_path.display().to_string(),
                    first: first.to_string(),
                    second: spec.name.clone(),
                });
            }
        }
        Ok(Self {
            specs,
            engine: SyncEngine::new(store),
            options,
        })
    }

    pub fn from_config(
        config: UpdaterConfig,
        store: Arc<S>,
        options: RunOptions,
    ) -> Result<Self, ConfigError> {
        Self::new(config.repositories, store, options)
    }

    /// Sync every repository and collect one report per spec.
    pub async fn run(&self) -> RunReport {
        let started_at = Utc::now();
        let jobs = self.options.jobs.max(1);
        info!(repositories = self.specs.len(), jobs, "starting update run");

        let semaphore = Arc::new(Semaphore::new(jobs));
        let policy = UpdatePolicy::new(self.options.force);

        let mut tasks = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let spec = spec.clone();
            let engine = self.engine.clone();
            let semaphore = semaphore.clone();
            let timeout = self.options.repo_timeout;
            let span = info_span!("repo", name = %spec.name);

            tasks.push(tokio::spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await;
                    let started = Instant::now();
                    let outcome = match policy.decide(&spec, Utc::now()) {
                        Decision::Skip { next_due } => {
                            info!(next_due = %next_due.to_rfc3339(), "skipping, update not due");
                            SyncOutcome::Skipped { next_due }
                        }
                        Decision::Run => sync_with_timeout(engine, spec.clone(), timeout).await,
                    };
                    info!(outcome = outcome.kind(), "repository finished");
                    RepositoryReport {
                        name: spec.name,
                        path: spec.local_path,
                        outcome,
                        elapsed: started.elapsed(),
                    }
                }
                .instrument(span),
            ));
        }

        let mut repositories = Vec::with_capacity(tasks.len());
        for (spec, task) in self.specs.iter().zip(tasks) {
            let report = match task.await {
                Ok(report) => report,
                Err(e) => RepositoryReport {
                    name: spec.name.clone(),
                    path: spec.local_path.clone(),
                    outcome: SyncOutcome::Failed {
                        reason: SyncError::InternalError(format!("repository task aborted: {e}")),
                    },
                    elapsed: Duration::ZERO,
                },
            };
            repositories.push(report);
        }

        let report = RunReport {
            repositories,
            started_at,
            completed_at: Utc::now(),
        };
        info!(success = report.is_success(), "update run complete");
        report
    }
}

/// Run the blocking sync on the blocking pool, bounded by `timeout`.
///
/// On timeout the blocking task is abandoned; the store's own network
/// timeout bounds how long it can keep running.
async fn sync_with_timeout<S: RepositoryStore + 'static>(
    engine: SyncEngine<S>,
    spec: RepositorySpec,
    timeout: Duration,
) -> SyncOutcome {
    let span = Span::current();
    let task = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        engine.sync(&spec)
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => SyncOutcome::Failed {
            reason: SyncError::InternalError(format!("sync task panicked: {e}")),
        },
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "repository sync timed out");
            SyncOutcome::Failed {
                reason: SyncError::Timeout {
                    secs: timeout.as_secs(),
                },
            }
        }
    }
}
