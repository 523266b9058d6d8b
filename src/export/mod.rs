//! Export job orchestration
//!
//! - [`job`] - Per-project state machine
//! - [`retry`] - Attempt ceiling and backoff policy
//! - [`runner`] - Drives one job through trigger → poll → download → verify
//! - [`scheduler`] - Bounded admission window over many jobs
//! - [`progress`] - Byte progress logging for long downloads
//! - [`side_export`] - Issues, merge requests, wikis and snippets after the archives

pub mod job;
pub mod progress;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod side_export;

pub use job::{ExportJob, JobState};
pub use retry::RetryPolicy;
pub use runner::{JobRunner, RunnerConfig};
pub use side_export::SideExporter;
pub use scheduler::{
    ActiveJobs, ErrorBudget, RecordObserver, RunStatus, Scheduler, SchedulerOutcome,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure taxonomy shared by the client, the job state machine and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Token rejected (401)
    AuthError,
    /// 429 with an optional retry-after hint
    RateLimited,
    /// Connection failures, timeouts, 5xx, broken bodies
    TransientNetworkError,
    /// Remote export did not finish before the job timeout
    ExportTimeout,
    /// Downloaded archive did not match the expected size or checksum
    ChecksumMismatch,
    /// Remote export reported `failed`
    RemoteExportFailed,
    /// Project no longer exists (404)
    RemoteNotFound,
    /// Token lacks permission for the project (403)
    PermissionDenied,
    /// Local filesystem failure
    DiskError,
    /// Cancelled by signal, error budget or instance abort
    Cancelled,
    /// Unexpected response shape
    ProtocolError,
}

impl ErrorKind {
    /// Whether a new trigger→download attempt may fix this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::TransientNetworkError
                | ErrorKind::ExportTimeout
                | ErrorKind::ChecksumMismatch
                | ErrorKind::RemoteExportFailed
        )
    }

    /// User-friendly description used in logs and the error log
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::AuthError => "authentication failed",
            ErrorKind::RateLimited => "rate limit exceeded",
            ErrorKind::TransientNetworkError => "network error",
            ErrorKind::ExportTimeout => "export timed out",
            ErrorKind::ChecksumMismatch => "archive verification failed",
            ErrorKind::RemoteExportFailed => "remote export failed",
            ErrorKind::RemoteNotFound => "project not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::DiskError => "disk error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ProtocolError => "unexpected response",
        }
    }

    /// Suggested remediation shown in the run summary
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorKind::AuthError => "Verify the access token and its api scope",
            ErrorKind::RateLimited => "Lower max_concurrent_exports or run outside peak hours",
            ErrorKind::TransientNetworkError => "Check network connectivity and try again",
            ErrorKind::ExportTimeout => "Increase timeout_minutes for large projects",
            ErrorKind::ChecksumMismatch => "Re-run the export; the download was incomplete",
            ErrorKind::RemoteExportFailed => "Check the GitLab Sidekiq logs for the project export",
            ErrorKind::RemoteNotFound => "The project was deleted or moved during the run",
            ErrorKind::PermissionDenied => "The token needs Maintainer access to export a project",
            ErrorKind::DiskError => "Check free space and permissions of the output directory",
            ErrorKind::Cancelled => "Re-run to resume; completed projects are skipped",
            ErrorKind::ProtocolError => "Check that the URL points at a GitLab API",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Terminal or per-attempt failure of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    /// Classified kind
    pub kind: ErrorKind,
    /// Human-readable detail (never contains credentials)
    pub message: String,
}

impl JobFailure {
    /// Create a failure
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Cancellation observed at a suspension point
    pub fn cancelled(reason: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Cancelled, reason.to_string())
    }

    /// Local filesystem failure
    pub fn disk(context: &str, err: impl fmt::Display) -> Self {
        Self::new(ErrorKind::DiskError, format!("{context}: {err}"))
    }
}
