//! Styling for the end-of-run summary.

use console::Style;

use gitupdater_core::{RunReport, SyncOutcome};

/// Marker and colour for an outcome: failures red, conflicts yellow, skipped
/// repositories dimmed, everything else green.
fn marker(outcome: &SyncOutcome) -> (&'static str, Style) {
    match outcome {
        SyncOutcome::Failed { .. } => ("✗", Style::new().red()),
        SyncOutcome::ConflictDetected { .. } => ("⚠", Style::new().yellow()),
        SyncOutcome::Skipped { .. } => ("-", Style::new().dim()),
        _ => ("✓", Style::new().green()),
    }
}

/// One summary line for a repository.
pub fn outcome_line(name: &str, outcome: &SyncOutcome) -> String {
    let (mark, style) = marker(outcome);
    format!(
        "{} {}: {}",
        style.apply_to(mark),
        Style::new().bold().apply_to(name),
        outcome
    )
}

/// Closing line with per-kind totals, e.g. `3 repositories in 1.2s: 2 cloned, 1 failed`.
pub fn totals_line(report: &RunReport) -> String {
    let mut kinds: Vec<_> = report.counts().into_iter().collect();
    kinds.sort();
    let totals: Vec<String> = kinds.iter().map(|(k, n)| format!("{} {}", n, k)).collect();
    let elapsed = (report.completed_at - report.started_at).num_milliseconds() as f64 / 1000.0;
    let line = format!(
        "{} repositories in {:.1}s: {}",
        report.repositories.len(),
        elapsed,
        totals.join(", ")
    );
    Style::new().dim().apply_to(line).to_string()
}
