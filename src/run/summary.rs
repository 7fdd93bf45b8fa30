//! Run results and exit code aggregation

use crate::{engine::ExitClass, report::Reporter, unit::UnitState};
use std::{path::PathBuf, time::Duration};

/// Final record of one unit.
#[derive(Clone, Debug)]
pub struct UnitReport {
    /// Unit path relative to the workspace.
    pub path: PathBuf,
    pub state: UnitState,
    /// One-line reason when the unit failed or was skipped.
    pub reason: Option<String>,
    pub duration: Duration,
    /// Exit classification of the engine run, when one happened.
    pub exit: Option<ExitClass>,
}

/// Aggregated result of a run.
///
/// The detailed-exit aggregate follows the plan-family convention: `1` if
/// any unit errored, else `2` if any unit reported changes, else `0`.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<UnitReport>,
    pub duration: Duration,
    errored: bool,
    changes: bool,
    cancelled: bool,
}

impl RunSummary {
    pub fn record(&mut self, report: UnitReport) {
        match report.state {
            UnitState::Failed => self.errored = true,
            UnitState::Succeeded => {
                if report.exit == Some(ExitClass::SuccessWithChanges) {
                    self.changes = true;
                }
            }
            _ => {}
        }
        self.reports.push(report);
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    pub fn set_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn has_changes(&self) -> bool {
        self.changes
    }

    /// The process exit code: `0` success, `1` any error or cancellation,
    /// `2` changes under the detailed exit code convention.
    pub fn exit_code(&self) -> i32 {
        if self.errored || self.cancelled {
            1
        } else if self.changes {
            2
        } else {
            0
        }
    }

    /// Emits the per-unit summary through the reporter: relative path, final
    /// state and a one-line reason on failure.
    pub fn render(&self, reporter: &Reporter) {
        if self.reports.is_empty() {
            reporter.info(None, "no runnable units found");
            return;
        }
        reporter.info(None, format!("run summary ({} units, {:.1?}):", self.reports.len(), self.duration));
        for report in &self.reports {
            let mut line = format!(
                "  {:<40} {:<16} {:>8}",
                report.path.display().to_string(),
                report.state.as_str(),
                format!("{:.1?}", report.duration)
            );
            if report.exit == Some(ExitClass::SuccessWithChanges) {
                line.push_str("  changes pending");
            }
            if let Some(reason) = &report.reason {
                line.push_str(&format!("  {reason}"));
            }
            match report.state {
                UnitState::Failed | UnitState::FailedUpstream => reporter.error(None, line),
                _ => reporter.info(None, line),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(state: UnitState, exit: Option<ExitClass>) -> UnitReport {
        UnitReport { path: "app".into(), state, reason: None, duration: Duration::ZERO, exit }
    }

    #[test]
    fn error_dominates_changes() {
        let mut summary = RunSummary::default();
        summary.record(report(UnitState::Succeeded, Some(ExitClass::SuccessWithChanges)));
        summary.record(report(UnitState::Failed, Some(ExitClass::Error(1))));
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn changes_beat_clean_success() {
        let mut summary = RunSummary::default();
        summary.record(report(UnitState::Succeeded, Some(ExitClass::Success)));
        summary.record(report(UnitState::Succeeded, Some(ExitClass::SuccessWithChanges)));
        assert_eq!(summary.exit_code(), 2);
    }

    #[test]
    fn clean_run_exits_zero() {
        let mut summary = RunSummary::default();
        summary.record(report(UnitState::Succeeded, Some(ExitClass::Success)));
        summary.record(report(UnitState::Excluded, None));
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn upstream_failures_do_not_add_errors() {
        // the producer's failure already sets the error bit
        let mut summary = RunSummary::default();
        summary.record(report(UnitState::Failed, Some(ExitClass::Error(1))));
        summary.record(report(UnitState::FailedUpstream, None));
        assert_eq!(summary.exit_code(), 1);
        assert!(summary.errored());
    }
}
