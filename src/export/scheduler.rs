//! Bounded admission of export jobs
//!
//! Projects are admitted in enumeration order into a window of at most
//! `max_concurrent` jobs. Cancelling the scope closes admission; jobs already
//! admitted observe the cancellation at their next suspension point and drain.

use super::runner::JobRunner;
use super::ErrorKind;
use crate::config::ErrorBudgetConfig;
use crate::metrics;
use crate::report::{Outcome, ReportRecord};
use crate::shutdown::CancelReason;
use crate::ProjectRef;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Consecutive disk failures after which an instance is aborted
pub const MAX_CONSECUTIVE_DISK_ERRORS: usize = 3;

/// How a scheduler run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every admitted project reached a terminal state without cancellation
    Finished,
    /// Stopped by an operator signal
    Cancelled,
    /// Stopped because the error budget was exceeded
    BudgetExceeded,
    /// Stopped after repeated disk errors, or the instance could not be enumerated
    InstanceAborted,
}

impl RunStatus {
    fn from_reason(reason: Option<CancelReason>) -> Self {
        match reason {
            None => RunStatus::Finished,
            Some(CancelReason::Signal) => RunStatus::Cancelled,
            Some(CancelReason::ErrorBudget) => RunStatus::BudgetExceeded,
            Some(CancelReason::InstanceAborted) => RunStatus::InstanceAborted,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunStatus::Finished => "finished",
            RunStatus::Cancelled => "cancelled",
            RunStatus::BudgetExceeded => "error budget exceeded",
            RunStatus::InstanceAborted => "instance aborted",
        };
        f.write_str(text)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct Occupancy {
    current: usize,
    peak: usize,
}

/// Number of jobs holding a concurrency slot
#[derive(Debug)]
pub struct ActiveJobs {
    instance: String,
    occupancy: Mutex<Occupancy>,
}

impl ActiveJobs {
    /// Counter for `instance`
    pub fn new(instance: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            instance: instance.into(),
            occupancy: Mutex::new(Occupancy::default()),
        })
    }

    /// Occupy a slot until the guard drops
    pub fn enter(self: &Arc<Self>) -> ActiveGuard {
        let current = {
            let mut occupancy = lock(&self.occupancy);
            occupancy.current += 1;
            occupancy.peak = occupancy.peak.max(occupancy.current);
            occupancy.current
        };
        metrics::set_in_flight(&self.instance, current);
        ActiveGuard {
            jobs: Arc::clone(self),
        }
    }

    /// Slots in use now
    pub fn current(&self) -> usize {
        lock(&self.occupancy).current
    }

    /// Highest occupancy observed
    pub fn peak(&self) -> usize {
        lock(&self.occupancy).peak
    }
}

/// Releases an [`ActiveJobs`] slot on drop
#[derive(Debug)]
pub struct ActiveGuard {
    jobs: Arc<ActiveJobs>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let current = {
            let mut occupancy = lock(&self.jobs.occupancy);
            occupancy.current = occupancy.current.saturating_sub(1);
            occupancy.current
        };
        metrics::set_in_flight(&self.jobs.instance, current);
    }
}

/// Failure-ratio circuit breaker shared by every instance of a run
#[derive(Debug)]
pub struct ErrorBudget {
    config: ErrorBudgetConfig,
    counts: Mutex<(usize, usize)>,
}

impl ErrorBudget {
    /// Tracker for `config`
    pub fn new(config: ErrorBudgetConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            counts: Mutex::new((0, 0)),
        })
    }

    /// Account for a terminal record; returns `true` once the budget is exceeded.
    ///
    /// Skipped projects and cancellations do not count.
    pub fn record(&self, record: &ReportRecord) -> bool {
        let mut counts = lock(&self.counts);
        match record.outcome {
            Outcome::Skipped => return self.exceeded(&counts),
            Outcome::Failed if record.error_kind == Some(ErrorKind::Cancelled) => {
                return self.exceeded(&counts)
            }
            Outcome::Failed => {
                counts.0 += 1;
                counts.1 += 1;
            }
            Outcome::Completed => counts.0 += 1,
        }
        self.exceeded(&counts)
    }

    /// Whether the budget is exceeded now
    pub fn is_exceeded(&self) -> bool {
        self.exceeded(&lock(&self.counts))
    }

    /// `(terminal, failed)` jobs counted so far
    pub fn counts(&self) -> (usize, usize) {
        *lock(&self.counts)
    }

    fn exceeded(&self, &(terminal, failed): &(usize, usize)) -> bool {
        terminal >= self.config.min_jobs.max(1)
            && failed as f64 / terminal as f64 > self.config.max_failure_ratio
    }
}

/// Result of one scheduler run
#[derive(Debug, Clone)]
pub struct SchedulerOutcome {
    /// How the run ended
    pub status: RunStatus,
    /// Projects handed to the scheduler after deduplication
    pub total: usize,
    /// Terminal records in completion order
    pub records: Vec<ReportRecord>,
    /// Highest number of concurrently admitted jobs
    pub peak_active: usize,
}

impl SchedulerOutcome {
    /// Projects never admitted
    pub fn not_started(&self) -> usize {
        self.total.saturating_sub(self.records.len())
    }
}

/// Callback invoked with every terminal record, in completion order
pub type RecordObserver = Arc<dyn Fn(&ReportRecord) + Send + Sync>;

/// Admission window over one instance's projects
pub struct Scheduler {
    runner: Arc<JobRunner>,
    active: Arc<ActiveJobs>,
    budget: Option<Arc<ErrorBudget>>,
    observer: Option<RecordObserver>,
}

impl Scheduler {
    /// Scheduler executing jobs with `runner`
    pub fn new(runner: Arc<JobRunner>) -> Self {
        let active = ActiveJobs::new(runner.instance_name());
        Self {
            runner,
            active,
            budget: None,
            observer: None,
        }
    }

    /// Abort the run when the shared budget is exceeded
    pub fn with_error_budget(mut self, budget: Option<Arc<ErrorBudget>>) -> Self {
        self.budget = budget;
        self
    }

    /// Report every terminal record to `observer`
    pub fn with_observer(mut self, observer: Option<RecordObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run every project to a terminal state, at most `max_concurrent` at a time.
    pub async fn run(&self, project_refs: Vec<ProjectRef>, max_concurrent: usize) -> SchedulerOutcome {
        let mut seen = HashSet::new();
        let projects: Vec<ProjectRef> = project_refs
            .into_iter()
            .filter(|p| seen.insert(p.key()))
            .collect();
        let total = projects.len();
        let max_concurrent = max_concurrent.max(1);
        let shutdown = Arc::clone(self.runner.shutdown());

        info!(
            instance = self.runner.instance_name(),
            total,
            max_concurrent,
            "Scheduling exports"
        );

        let mut consecutive_disk_errors = 0usize;
        let records: Vec<ReportRecord> = stream::iter(projects)
            .take_while(|_| futures::future::ready(!shutdown.is_cancelled()))
            .map(|project| {
                let runner = Arc::clone(&self.runner);
                let active = Arc::clone(&self.active);
                async move {
                    let _slot = active.enter();
                    runner.run(project).await
                }
            })
            .buffer_unordered(max_concurrent)
            .inspect(|record| {
                if let Some(observer) = &self.observer {
                    observer(record);
                }
                match (record.outcome, record.error_kind) {
                    (Outcome::Failed, Some(ErrorKind::DiskError)) => {
                        consecutive_disk_errors += 1;
                        if consecutive_disk_errors >= MAX_CONSECUTIVE_DISK_ERRORS
                            && !shutdown.is_cancelled()
                        {
                            error!(
                                instance = self.runner.instance_name(),
                                consecutive_disk_errors,
                                "Repeated disk errors, aborting instance"
                            );
                            shutdown.cancel(CancelReason::InstanceAborted);
                        }
                    }
                    (Outcome::Completed, _) => consecutive_disk_errors = 0,
                    _ => {}
                }

                if let Some(budget) = &self.budget {
                    if budget.record(record) && !shutdown.is_cancelled() {
                        let (terminal, failed) = budget.counts();
                        warn!(terminal, failed, "Error budget exceeded, stopping admissions");
                        shutdown.cancel(CancelReason::ErrorBudget);
                    }
                }
            })
            .collect()
            .await;

        let status = if shutdown.is_cancelled() {
            RunStatus::from_reason(shutdown.reason())
        } else {
            RunStatus::Finished
        };
        let outcome = SchedulerOutcome {
            status,
            total,
            records,
            peak_active: self.active.peak(),
        };
        info!(
            instance = self.runner.instance_name(),
            status = %outcome.status,
            finished = outcome.records.len(),
            not_started = outcome.not_started(),
            peak_active = outcome.peak_active,
            "Scheduler finished"
        );
        outcome
    }
}
