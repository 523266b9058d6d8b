//! Export job structures and state tracking

use super::{ErrorKind, JobFailure};
use crate::ProjectRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Export job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum JobState {
    /// Admitted, export not yet triggered (also the state between attempts)
    #[default]
    Pending,
    /// Remote export requested
    Triggered,
    /// Waiting for the remote export to finish
    Polling,
    /// Streaming the archive to a temporary file
    Downloading,
    /// Checking size and checksum
    Verifying,
    /// Archive in place and recorded in the ledger
    Completed,
    /// Gave up; see `last_error`
    Failed,
    /// Already completed in a previous run
    Skipped,
}

impl JobState {
    /// Terminal states have no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Skipped)
    }

    /// States that hold remote or disk resources and count against the concurrency bound
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobState::Triggered | JobState::Polling | JobState::Downloading | JobState::Verifying
        )
    }

    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Triggered | Skipped | Failed) => true,
            (Triggered, Polling | Failed) => true,
            (Polling, Downloading | Failed | Pending) => true,
            (Downloading, Verifying | Failed | Pending) => true,
            (Verifying, Completed | Failed | Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Rejected state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Current state
    pub from: JobState,
    /// Requested state
    pub to: JobState,
}

impl From<InvalidTransition> for JobFailure {
    fn from(err: InvalidTransition) -> Self {
        JobFailure::new(ErrorKind::ProtocolError, err.to_string())
    }
}

/// One project's export, owned by the scheduler for its lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    /// Project being exported
    pub project: ProjectRef,
    /// Current state
    pub state: JobState,
    /// Attempts started so far (one attempt = one trigger→download cycle)
    pub attempt_count: u32,
    /// Most recent failure, if any
    pub last_error: Option<JobFailure>,
    /// Admission time
    pub created_at: DateTime<Utc>,
    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl ExportJob {
    /// Create a pending job
    pub fn new(project: ProjectRef) -> Self {
        let now = Utc::now();
        Self {
            project,
            state: JobState::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: JobState) -> Result<JobState, InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        self.updated_at = Utc::now();
        Ok(previous)
    }

    /// Record a failure and move to `Failed`
    pub fn fail(&mut self, failure: JobFailure) -> Result<JobState, InvalidTransition> {
        self.last_error = Some(failure);
        self.transition(JobState::Failed)
    }
}
