//! gitupdater command-line tool.
//!
//! Reads an INI list of repositories, clones or updates each one under the
//! root directory, prints one line per repository and exits non-zero when any
//! repository failed or hit merge conflicts.

mod style;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gitupdater_core::git::store::{StoreOptions, DEFAULT_NETWORK_TIMEOUT};
use gitupdater_core::{GitStore, RepositorySet, RunOptions, RunReport, UpdaterConfig};

/// Exit code when any repository failed or hit merge conflicts.
const EXIT_FAILURE: u8 = 1;
/// Exit code for an unusable configuration.
const EXIT_CONFIG: u8 = 2;

/// How long shutdown waits for repositories abandoned at their timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Keep local git working copies in sync with their upstreams.
#[derive(Parser, Debug)]
#[command(name = "gitupdater", version, about)]
struct Cli {
    /// Config file to use.
    #[arg(short, long, default_value = "config.ini")]
    config: PathBuf,

    /// Update every repository regardless of its interval.
    #[arg(short, long)]
    force: bool,

    /// Root directory; each section is a subdirectory of it. Defaults to cwd.
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// Number of repositories to update concurrently.
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    jobs: u16,

    /// Per-repository timeout in seconds.
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let set = match build_set(&cli) {
        Ok(set) => set,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let report = runtime.block_on(set.run());
    print_summary(&report);

    // A repository that hit its timeout may still be blocked inside git.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    ExitCode::from(exit_status(&report))
}

fn exit_status(report: &RunReport) -> u8 {
    if report.is_success() {
        0
    } else {
        EXIT_FAILURE
    }
}

fn build_set(cli: &Cli) -> Result<RepositorySet<GitStore>> {
    let root = match &cli.directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to determine current directory")?,
    };

    let config = UpdaterConfig::load_from_file(&cli.config, &root)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    if config.is_empty() {
        info!("no repositories configured");
    }

    let repo_timeout = Duration::from_secs(cli.timeout);
    let store = GitStore::new(StoreOptions {
        network_timeout: DEFAULT_NETWORK_TIMEOUT.min(repo_timeout),
        ..Default::default()
    });
    let options = RunOptions {
        jobs: usize::from(cli.jobs),
        repo_timeout,
        force: cli.force,
    };

    RepositorySet::from_config(config, Arc::new(store), options)
        .context("invalid repository configuration")
}

fn print_summary(report: &RunReport) {
    for repo in &report.repositories {
        println!("{}", style::outcome_line(&repo.name, &repo.outcome));
    }
    println!("{}", style::totals_line(report));
}
