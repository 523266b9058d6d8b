//! Per-instance and whole-run summaries

use super::{Outcome, ReportRecord, ReportResult, SideExportRecord, SideOutcome};
use crate::export::progress::format_bytes;
use crate::export::{ErrorKind, RunStatus};
use crate::output::write_json_atomic;
use crate::ProjectRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};

/// Exit code for a run without failures
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when any job failed or an instance stopped early
pub const EXIT_FAILURES: i32 = 1;

/// Outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Projects scheduled
    pub total: usize,
    /// Exported in this run
    pub completed: usize,
    /// Gave up
    pub failed: usize,
    /// Completed in an earlier run
    pub skipped: usize,
    /// Never admitted because the run stopped early
    pub not_started: usize,
}

impl Totals {
    /// Count `records` out of `total` scheduled projects
    pub fn from_records(total: usize, records: &[ReportRecord]) -> Self {
        let mut totals = Totals {
            total,
            ..Totals::default()
        };
        for record in records {
            match record.outcome {
                Outcome::Completed => totals.completed += 1,
                Outcome::Failed => totals.failed += 1,
                Outcome::Skipped => totals.skipped += 1,
            }
        }
        totals.not_started = total.saturating_sub(records.len());
        totals
    }

    fn add(&mut self, other: &Totals) {
        self.total += other.total;
        self.completed += other.completed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.not_started += other.not_started;
    }
}

/// Counts of exported issues, merge requests, wikis and snippets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideExportTotals {
    /// Collections written
    pub saved: usize,
    /// Items across written collections
    pub items: usize,
    /// Collections the project or token does not offer
    pub unavailable: usize,
    /// Collections that failed
    pub failed: usize,
}

impl SideExportTotals {
    /// Count one collection
    pub fn record(&mut self, record: &SideExportRecord) {
        match record.outcome {
            SideOutcome::Saved => {
                self.saved += 1;
                self.items += record.items;
            }
            SideOutcome::Unavailable => self.unavailable += 1,
            SideOutcome::Failed => self.failed += 1,
        }
    }

    fn add(&mut self, other: &SideExportTotals) {
        self.saved += other.saved;
        self.items += other.items;
        self.unavailable += other.unavailable;
        self.failed += other.failed;
    }
}

/// One failed project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    /// Project
    pub project: ProjectRef,
    /// Failure kind
    pub error_kind: ErrorKind,
    /// Failure detail
    pub error: String,
    /// Attempts made
    pub attempt_count: u32,
}

/// Report of one instance, written as `export_report.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    /// Instance name
    pub instance: String,
    /// Run directory
    pub run_dir: PathBuf,
    /// Start of the instance run
    pub started_at: DateTime<Utc>,
    /// End of the instance run
    pub finished_at: DateTime<Utc>,
    /// How the scheduler stopped
    pub status: RunStatus,
    /// Outcome counts
    pub totals: Totals,
    /// Archive bytes written
    pub bytes: u64,
    /// Retries across all jobs
    pub retries: u64,
    /// Failed projects
    pub failures: Vec<FailureSummary>,
    /// Latest record per project, in completion order
    pub records: Vec<ReportRecord>,
    /// Issues, merge requests, wikis and snippets
    #[serde(default)]
    pub side_exports: SideExportTotals,
    /// Collections that could not be exported
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub side_export_failures: Vec<SideExportRecord>,
    /// Why the instance stopped, when it was aborted by an error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstanceReport {
    /// Report for an instance whose projects were never scheduled
    pub fn not_run(
        instance: impl Into<String>,
        run_dir: PathBuf,
        started_at: DateTime<Utc>,
        status: RunStatus,
    ) -> Self {
        Self {
            instance: instance.into(),
            run_dir,
            started_at,
            finished_at: Utc::now(),
            status,
            totals: Totals::default(),
            bytes: 0,
            retries: 0,
            failures: Vec::new(),
            records: Vec::new(),
            side_exports: SideExportTotals::default(),
            side_export_failures: Vec::new(),
            error: None,
        }
    }

    /// Report for an instance stopped by an error outside any single job
    pub fn aborted(
        instance: impl Into<String>,
        run_dir: PathBuf,
        started_at: DateTime<Utc>,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::not_run(instance, run_dir, started_at, RunStatus::InstanceAborted)
        }
    }

    /// Write the report atomically
    pub fn write(&self, path: &Path) -> ReportResult<()> {
        write_json_atomic(path, self)?;
        Ok(())
    }
}

/// Report of a whole run, written as `run_report_<ts>.json` under the output root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
    /// Totals across instances
    pub totals: Totals,
    /// Archive bytes across instances
    pub bytes: u64,
    /// Retries across instances
    pub retries: u64,
    /// Side exports across instances
    #[serde(default)]
    pub side_exports: SideExportTotals,
    /// Per-instance breakdown
    pub instances: Vec<InstanceReport>,
}

impl RunReport {
    /// Aggregate instance reports
    pub fn from_instances(started_at: DateTime<Utc>, instances: Vec<InstanceReport>) -> Self {
        let mut totals = Totals::default();
        let mut bytes = 0;
        let mut retries = 0;
        let mut side_exports = SideExportTotals::default();
        for instance in &instances {
            totals.add(&instance.totals);
            bytes += instance.bytes;
            retries += instance.retries;
            side_exports.add(&instance.side_exports);
        }
        Self {
            started_at,
            finished_at: Utc::now(),
            totals,
            bytes,
            retries,
            side_exports,
            instances,
        }
    }

    /// Failures of every instance
    pub fn failures(&self) -> impl Iterator<Item = &FailureSummary> {
        self.instances.iter().flat_map(|i| i.failures.iter())
    }

    /// Whether every instance ran to the end without failed jobs
    pub fn is_clean(&self) -> bool {
        self.totals.failed == 0
            && self
                .instances
                .iter()
                .all(|i| i.status == RunStatus::Finished)
    }

    /// Process exit code for this run
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURES
        }
    }

    /// Write the report atomically
    pub fn write(&self, path: &Path) -> ReportResult<()> {
        write_json_atomic(path, self)?;
        Ok(())
    }

    /// Human-readable summary for the terminal
    pub fn render(&self) -> String {
        let mut out = String::new();
        let elapsed = (self.finished_at - self.started_at).num_seconds().max(0);
        let _ = writeln!(out, "Export run finished in {elapsed}s");
        for instance in &self.instances {
            let t = &instance.totals;
            let _ = writeln!(
                out,
                "  {}: {} completed, {} skipped, {} failed, {} not started ({}) [{}]",
                instance.instance,
                t.completed,
                t.skipped,
                t.failed,
                t.not_started,
                format_bytes(instance.bytes),
                instance.status
            );
            if let Some(error) = &instance.error {
                let _ = writeln!(out, "    stopped by: {error}");
            }
        }
        let t = &self.totals;
        let _ = writeln!(
            out,
            "Total: {} projects, {} completed, {} skipped, {} failed, {} not started, {} retries",
            t.total, t.completed, t.skipped, t.failed, t.not_started, self.retries
        );
        let side = &self.side_exports;
        if side.saved + side.failed > 0 {
            let _ = writeln!(
                out,
                "Side exports: {} collections ({} items), {} failed",
                side.saved, side.items, side.failed
            );
        }

        let failures: Vec<_> = self.failures().collect();
        if !failures.is_empty() {
            let _ = writeln!(out, "Failed projects:");
            for failure in failures {
                let _ = writeln!(
                    out,
                    "  {} - {} ({})",
                    failure.project,
                    failure.error_kind.description(),
                    failure.error_kind.suggestion()
                );
            }
        }
        out
    }
}
