//! Single-writer consumer of report events for one instance run.

use super::summary::{FailureSummary, InstanceReport, SideExportTotals, Totals};
use super::{
    Outcome, ReportError, ReportEvent, ReportRecord, ReportResult, SideExportRecord, SideOutcome,
};
use crate::export::RunStatus;
use crate::ProjectKey;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffered events in front of the aggregator
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Timestamp format of `errors.log` lines
pub const ERROR_LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

enum Message {
    Event(ReportEvent),
    Close,
}

/// Cloneable event sender given to job runners
#[derive(Debug, Clone)]
pub struct ReportSender {
    tx: mpsc::Sender<Message>,
}

impl ReportSender {
    /// Deliver `event`; a stopped aggregator is logged, not propagated
    pub async fn send(&self, event: ReportEvent) {
        if self.tx.send(Message::Event(event)).await.is_err() {
            warn!("Report aggregator stopped; event dropped");
        }
    }
}

#[derive(Default)]
struct State {
    latest: HashMap<ProjectKey, usize>,
    records: Vec<ReportRecord>,
    retries: u64,
    bytes: u64,
    side_exports: SideExportTotals,
    side_export_failures: Vec<SideExportRecord>,
}

impl State {
    fn record(&mut self, record: ReportRecord) {
        if let Some(bytes) = record.bytes {
            self.bytes += bytes;
        }
        self.retries += u64::from(record.attempt_count.saturating_sub(1));
        match self.latest.get(&record.project.key()) {
            Some(&idx) => {
                // A retry pass over an already reported project
                self.retries += 1;
                self.records[idx] = record;
            }
            None => {
                self.latest.insert(record.project.key(), self.records.len());
                self.records.push(record);
            }
        }
    }
}

/// Aggregator task owning the instance's report files
pub struct ReportAggregator {
    instance: String,
    error_log_path: PathBuf,
    error_log: Option<tokio::fs::File>,
    state: State,
}

/// Join side of a spawned aggregator
pub struct AggregatorHandle {
    instance: String,
    run_dir: PathBuf,
    started_at: DateTime<Utc>,
    sender: ReportSender,
    task: JoinHandle<State>,
}

impl ReportAggregator {
    /// Spawn the aggregator for one instance run
    pub fn spawn(
        instance: impl Into<String>,
        run_dir: PathBuf,
        error_log_path: PathBuf,
        started_at: DateTime<Utc>,
    ) -> AggregatorHandle {
        let instance = instance.into();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let aggregator = ReportAggregator {
            instance: instance.clone(),
            error_log_path,
            error_log: None,
            state: State::default(),
        };
        let task = tokio::spawn(aggregator.run(rx));
        AggregatorHandle {
            instance,
            run_dir,
            started_at,
            sender: ReportSender { tx },
            task,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Message>) -> State {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Event(ReportEvent::Transition {
                    project,
                    from,
                    to,
                    attempt,
                }) => {
                    debug!(instance = %self.instance, project = %project, %from, %to, attempt, "Job transition");
                }
                Message::Event(ReportEvent::Finished(record)) => {
                    if record.outcome == Outcome::Failed {
                        self.append_line(format_error_line(Utc::now(), &record)).await;
                    }
                    self.state.record(record);
                }
                Message::Event(ReportEvent::SideExport(record)) => {
                    self.state.side_exports.record(&record);
                    if record.outcome == SideOutcome::Failed {
                        self.append_line(format_side_error_line(Utc::now(), &record))
                            .await;
                        self.state.side_export_failures.push(record);
                    }
                }
                Message::Close => break,
            }
        }
        if let Some(file) = self.error_log.as_mut() {
            if let Err(e) = file.sync_all().await {
                warn!(path = %self.error_log_path.display(), error = %e, "Failed to sync error log");
            }
        }
        self.state
    }

    async fn append_line(&mut self, line: String) {
        if self.error_log.is_none() {
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.error_log_path)
                .await
            {
                Ok(file) => self.error_log = Some(file),
                Err(e) => {
                    warn!(path = %self.error_log_path.display(), error = %e, "Cannot open error log");
                    return;
                }
            }
        }
        if let Some(file) = self.error_log.as_mut() {
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.flush().await
            }
            .await;
            if let Err(e) = written {
                warn!(path = %self.error_log_path.display(), error = %e, "Failed to write error log");
            }
        }
    }
}

/// One `errors.log` line, newline included
pub fn format_error_line(at: DateTime<Utc>, record: &ReportRecord) -> String {
    let kind = record
        .error_kind
        .map(|k| k.to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    format!(
        "[{}] [ERROR] {} (#{}) {} after {} attempt(s): {}\n",
        at.format(ERROR_LOG_TIMESTAMP_FORMAT),
        record.project.path,
        record.project.project_id,
        kind,
        record.attempt_count,
        record.error.as_deref().unwrap_or("")
    )
}

/// `errors.log` line of a failed side export, newline included
pub fn format_side_error_line(at: DateTime<Utc>, record: &SideExportRecord) -> String {
    let kind = record
        .error_kind
        .map(|k| k.to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    format!(
        "[{}] [ERROR] {} (#{}) {} export {}: {}\n",
        at.format(ERROR_LOG_TIMESTAMP_FORMAT),
        record.project.path,
        record.project.project_id,
        record.resource,
        kind,
        record.error.as_deref().unwrap_or("")
    )
}

impl AggregatorHandle {
    /// Sender for job runners
    pub fn sender(&self) -> ReportSender {
        self.sender.clone()
    }

    /// Stop the aggregator after all queued events and write `export_report.json`.
    ///
    /// `total` is the number of projects handed to the scheduler.
    pub async fn finish(
        self,
        status: RunStatus,
        total: usize,
        report_path: PathBuf,
    ) -> ReportResult<InstanceReport> {
        // A send error means the task already exited; join reports why.
        let _ = self.sender.tx.send(Message::Close).await;
        let state = self
            .task
            .await
            .map_err(|_| ReportError::AggregatorStopped)?;

        let failures = state
            .records
            .iter()
            .filter(|r| r.outcome == Outcome::Failed)
            .filter_map(|r| {
                Some(FailureSummary {
                    project: r.project.clone(),
                    error_kind: r.error_kind?,
                    error: r.error.clone().unwrap_or_default(),
                    attempt_count: r.attempt_count,
                })
            })
            .collect();

        let report = InstanceReport {
            instance: self.instance,
            run_dir: self.run_dir,
            started_at: self.started_at,
            finished_at: Utc::now(),
            status,
            totals: Totals::from_records(total, &state.records),
            bytes: state.bytes,
            retries: state.retries,
            failures,
            records: state.records,
            side_exports: state.side_exports,
            side_export_failures: state.side_export_failures,
            error: None,
        };
        report.write(&report_path)?;
        Ok(report)
    }
}
