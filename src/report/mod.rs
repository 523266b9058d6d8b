//! Run reporting
//!
//! Job runners send [`ReportEvent`]s to one aggregator task per instance. The
//! aggregator owns `errors.log` and `export_report.json` of the instance run
//! directory; nothing else writes them.

use crate::client::ProjectResource;
use crate::export::{ErrorKind, JobFailure, JobState};
use crate::ProjectRef;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod aggregator;
pub mod summary;

pub use aggregator::{AggregatorHandle, ReportAggregator, ReportSender};
pub use summary::{FailureSummary, InstanceReport, RunReport, SideExportTotals, Totals};

/// Report errors
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Aggregator task is gone
    #[error("report aggregator stopped unexpectedly")]
    AggregatorStopped,
}

impl From<crate::output::OutputError> for ReportError {
    fn from(err: crate::output::OutputError) -> Self {
        match err {
            crate::output::OutputError::IoError(msg) => ReportError::IoError(msg),
            crate::output::OutputError::SerializationError(msg) => {
                ReportError::SerializationError(msg)
            }
        }
    }
}

/// Result type for report operations
pub type ReportResult<T> = Result<T, ReportError>;

/// Terminal outcome of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Archive verified and recorded
    Completed,
    /// Gave up
    Failed,
    /// Completed by an earlier run
    Skipped,
}

/// Result of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    /// Project
    pub project: ProjectRef,
    /// Outcome
    pub outcome: Outcome,
    /// Wall time from admission to terminal state, in seconds
    pub duration_secs: f64,
    /// Trigger→download cycles started
    pub attempt_count: u32,
    /// Failure kind for `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Failure detail for `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Archive size for `Completed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

impl ReportRecord {
    /// Successful export
    pub fn completed(project: ProjectRef, duration: Duration, attempt_count: u32, bytes: u64) -> Self {
        Self {
            project,
            outcome: Outcome::Completed,
            duration_secs: duration.as_secs_f64(),
            attempt_count,
            error_kind: None,
            error: None,
            bytes: Some(bytes),
        }
    }

    /// Failed export
    pub fn failed(
        project: ProjectRef,
        duration: Duration,
        attempt_count: u32,
        failure: &JobFailure,
    ) -> Self {
        Self {
            project,
            outcome: Outcome::Failed,
            duration_secs: duration.as_secs_f64(),
            attempt_count,
            error_kind: Some(failure.kind),
            error: Some(failure.message.clone()),
            bytes: None,
        }
    }

    /// Project found in the ledger
    pub fn skipped(project: ProjectRef) -> Self {
        Self {
            project,
            outcome: Outcome::Skipped,
            duration_secs: 0.0,
            attempt_count: 0,
            error_kind: None,
            error: None,
            bytes: None,
        }
    }

    /// Whether another pass might succeed
    pub fn is_retryable_failure(&self) -> bool {
        self.outcome == Outcome::Failed && self.error_kind.is_some_and(|k| k.is_retryable())
    }
}

/// What happened to one collection of one project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideOutcome {
    /// Fetched and written (nothing is written for an empty collection)
    Saved,
    /// Feature disabled on the project or hidden from the token
    Unavailable,
    /// Gave up
    Failed,
}

/// Result of exporting one collection (issues, wiki pages, ...) of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideExportRecord {
    pub project: ProjectRef,
    pub resource: ProjectResource,
    pub outcome: SideOutcome,
    /// Items written
    pub items: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SideExportRecord {
    pub fn saved(project: ProjectRef, resource: ProjectResource, items: usize) -> Self {
        Self {
            project,
            resource,
            outcome: SideOutcome::Saved,
            items,
            error_kind: None,
            error: None,
        }
    }

    pub fn unavailable(project: ProjectRef, resource: ProjectResource) -> Self {
        Self {
            outcome: SideOutcome::Unavailable,
            ..Self::saved(project, resource, 0)
        }
    }

    pub fn failed(project: ProjectRef, resource: ProjectResource, failure: &JobFailure) -> Self {
        Self {
            outcome: SideOutcome::Failed,
            error_kind: Some(failure.kind),
            error: Some(failure.message.clone()),
            ..Self::saved(project, resource, 0)
        }
    }
}

/// Message from a job runner to the aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent {
    /// State change of a running job
    Transition {
        /// Project
        project: ProjectRef,
        /// Previous state
        from: JobState,
        /// New state
        to: JobState,
        /// Attempt number at the time of the change
        attempt: u32,
    },
    /// Terminal record
    Finished(ReportRecord),
    /// One collection of a project exported after the archive pass
    SideExport(SideExportRecord),
}
