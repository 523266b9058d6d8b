//! Drives one project through trigger → poll → download → verify.
//!
//! Every remote call, chunk read and sleep is raced against the shutdown
//! scope, so cancellation is observed within one suspension point. Archives
//! are streamed to `<name>.tar.gz.part` and only renamed into place after
//! verification; a failed or cancelled attempt removes the partial file.
//! A download that breaks mid-stream asks for the remaining bytes of the same
//! export with a `Range` request before the attempt is given up.

use super::job::{ExportJob, JobState};
use super::progress::DownloadProgress;
use super::retry::RetryPolicy;
use super::{ErrorKind, JobFailure};
use crate::client::{ApiError, ArchiveDownload, ExportApi, ExportStatus};
use crate::config::ExportSettings;
use crate::metrics::{self, ExportMetrics};
use crate::output::{sync_dir, RunLayout};
use crate::report::{ReportEvent, ReportRecord, ReportSender};
use crate::resume::{LedgerEntry, LedgerHandle};
use crate::shutdown::SharedShutdown;
use crate::{ProjectKey, ProjectRef};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, info_span, warn, Instrument};

/// Longest wait for a single archive chunk before the download counts as stalled
pub const DEFAULT_CHUNK_TIMEOUT_SECS: u64 = 300;

/// Ranged re-requests allowed within one download before the attempt fails
pub const MAX_DOWNLOAD_RESUMES: u32 = 3;

/// Timing and retry knobs for job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Attempt ceiling and backoff
    pub retry: RetryPolicy,
    /// Delay between export status polls
    pub poll_interval: Duration,
    /// Per-attempt limit on waiting for the remote export
    pub job_timeout: Duration,
    /// Stall limit between archive chunks
    pub chunk_timeout: Duration,
}

impl RunnerConfig {
    /// Knobs from validated settings
    pub fn from_settings(settings: &ExportSettings) -> Self {
        Self {
            retry: RetryPolicy::from_settings(settings),
            poll_interval: settings.poll_interval(),
            job_timeout: settings.job_timeout(),
            chunk_timeout: Duration::from_secs(DEFAULT_CHUNK_TIMEOUT_SECS),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from_settings(&ExportSettings::default())
    }
}

/// Failure of one attempt, with the server's retry hint if any
#[derive(Debug)]
struct AttemptError {
    failure: JobFailure,
    retry_after: Option<Duration>,
}

impl From<JobFailure> for AttemptError {
    fn from(failure: JobFailure) -> Self {
        Self {
            failure,
            retry_after: None,
        }
    }
}

impl From<ApiError> for AttemptError {
    fn from(err: ApiError) -> Self {
        Self {
            retry_after: err.retry_after(),
            failure: err.into(),
        }
    }
}

impl From<super::job::InvalidTransition> for AttemptError {
    fn from(err: super::job::InvalidTransition) -> Self {
        JobFailure::from(err).into()
    }
}

/// Archive fully written to the partial file
struct DownloadedArchive {
    sha256: String,
    bytes: u64,
    expected_size: Option<u64>,
    expected_sha256: Option<String>,
}

impl DownloadedArchive {
    /// Compare against what the server announced
    fn verify(self) -> Result<VerifiedArchive, AttemptError> {
        if let Some(expected) = self.expected_size {
            if expected != self.bytes {
                return Err(JobFailure::new(
                    ErrorKind::ChecksumMismatch,
                    format!("expected {expected} bytes, received {}", self.bytes),
                )
                .into());
            }
        }
        if let Some(expected) = &self.expected_sha256 {
            if !expected.eq_ignore_ascii_case(&self.sha256) {
                return Err(JobFailure::new(
                    ErrorKind::ChecksumMismatch,
                    format!("expected sha256 {expected}, computed {}", self.sha256),
                )
                .into());
            }
        }
        Ok(VerifiedArchive {
            sha256: self.sha256,
            bytes: self.bytes,
        })
    }
}

/// Archive that passed verification, ready to rename
struct VerifiedArchive {
    sha256: String,
    bytes: u64,
}

/// Executes export jobs for one instance
pub struct JobRunner {
    api: Arc<dyn ExportApi>,
    layout: Arc<RunLayout>,
    completed: Arc<HashSet<ProjectKey>>,
    ledger: LedgerHandle,
    reports: ReportSender,
    shutdown: SharedShutdown,
    config: RunnerConfig,
}

impl JobRunner {
    /// Create a runner
    pub fn new(
        api: Arc<dyn ExportApi>,
        layout: Arc<RunLayout>,
        completed: Arc<HashSet<ProjectKey>>,
        ledger: LedgerHandle,
        reports: ReportSender,
        shutdown: SharedShutdown,
        config: RunnerConfig,
    ) -> Self {
        Self {
            api,
            layout,
            completed,
            ledger,
            reports,
            shutdown,
            config,
        }
    }

    /// Instance this runner exports from
    pub fn instance_name(&self) -> &str {
        self.api.instance_name()
    }

    /// Shutdown scope observed by jobs
    pub fn shutdown(&self) -> &SharedShutdown {
        &self.shutdown
    }

    /// Run one job to a terminal state and report it.
    pub async fn run(&self, project: ProjectRef) -> ReportRecord {
        let span = info_span!(
            "export",
            instance = %project.instance_name,
            project_id = project.project_id,
            path = %project.path,
        );
        let record = self.run_job(project).instrument(span).await;
        self.reports.send(ReportEvent::Finished(record.clone())).await;
        record
    }

    async fn run_job(&self, project: ProjectRef) -> ReportRecord {
        let started = Instant::now();
        let mut job = ExportJob::new(project);

        if self.completed.contains(&job.project.key()) {
            if let Err(e) = self.advance(&mut job, JobState::Skipped).await {
                warn!(error = %e.failure, "Could not mark job skipped");
            }
            metrics::record_skipped(&job.project.instance_name);
            debug!("Already exported in an earlier run, skipping");
            return ReportRecord::skipped(job.project);
        }

        let metrics = ExportMetrics::start(&job.project.instance_name);

        loop {
            if self.shutdown.is_cancelled() {
                let failure = JobFailure::cancelled(self.cancel_reason());
                return self.finish_failed(job, failure, started, &metrics).await;
            }

            job.attempt_count += 1;
            info!(attempt = job.attempt_count, max_attempts = self.config.retry.max_attempts, "Starting export attempt");

            let error = match self.attempt(&mut job, &metrics).await {
                Ok(archive) => {
                    if let Err(e) = self.advance(&mut job, JobState::Completed).await {
                        return self.finish_failed(job, e.failure, started, &metrics).await;
                    }
                    metrics.record_success(archive.bytes);
                    info!(
                        bytes = archive.bytes,
                        attempts = job.attempt_count,
                        duration_secs = started.elapsed().as_secs(),
                        "Export completed"
                    );
                    return ReportRecord::completed(
                        job.project,
                        started.elapsed(),
                        job.attempt_count,
                        archive.bytes,
                    );
                }
                Err(error) => error,
            };

            let kind = error.failure.kind;
            if kind == ErrorKind::Cancelled
                || !self.config.retry.should_retry(kind, job.attempt_count)
            {
                return self.finish_failed(job, error.failure, started, &metrics).await;
            }

            let delay = self
                .config
                .retry
                .delay_for(job.attempt_count, error.retry_after);
            warn!(
                attempt = job.attempt_count,
                error = %error.failure,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying"
            );
            metrics.record_retry(kind, delay);
            job.last_error = Some(error.failure);
            if job.state != JobState::Pending {
                if let Err(e) = self.advance(&mut job, JobState::Pending).await {
                    return self.finish_failed(job, e.failure, started, &metrics).await;
                }
            }

            if self.cancellable(tokio::time::sleep(delay)).await.is_err() {
                let failure = JobFailure::cancelled(self.cancel_reason());
                return self.finish_failed(job, failure, started, &metrics).await;
            }
        }
    }

    async fn finish_failed(
        &self,
        mut job: ExportJob,
        failure: JobFailure,
        started: Instant,
        metrics: &ExportMetrics,
    ) -> ReportRecord {
        warn!(
            error_kind = %failure.kind,
            attempts = job.attempt_count,
            error = %failure.message,
            "Export failed"
        );
        metrics.record_failure(failure.kind);
        let record = ReportRecord::failed(job.project.clone(), started.elapsed(), job.attempt_count, &failure);
        let from = job.state;
        if job.fail(failure).is_ok() {
            self.emit(&job, from).await;
        }
        record
    }

    /// One trigger → poll → download → verify → commit cycle
    async fn attempt(
        &self,
        job: &mut ExportJob,
        metrics: &ExportMetrics,
    ) -> Result<VerifiedArchive, AttemptError> {
        self.cancellable(self.api.trigger_export(&job.project))
            .await??;
        self.advance(job, JobState::Triggered).await?;
        self.advance(job, JobState::Polling).await?;

        self.wait_for_export(&job.project).await?;

        self.advance(job, JobState::Downloading).await?;
        let partial = self.layout.partial_path(&job.project);
        let verified = match self.download_to_file(&job.project, &partial, metrics).await {
            Ok(archive) => {
                self.advance(job, JobState::Verifying).await?;
                archive.verify()
            }
            Err(e) => Err(e),
        };
        match verified {
            Ok(archive) => self.commit(&job.project, &partial, archive).await,
            Err(e) => {
                remove_partial(&partial).await;
                Err(e)
            }
        }
    }

    /// Poll until the remote export is finished or the attempt times out.
    ///
    /// A rate-limited poll waits for the server's retry-after hint when it is
    /// longer than the poll interval.
    async fn wait_for_export(&self, project: &ProjectRef) -> Result<(), AttemptError> {
        let deadline = tokio::time::Instant::now() + self.config.job_timeout;
        let mut last_error: Option<ApiError> = None;
        let mut wait = self.config.poll_interval;

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                let detail = last_error
                    .map(|e| format!(" (last poll error: {e})"))
                    .unwrap_or_default();
                return Err(JobFailure::new(
                    ErrorKind::ExportTimeout,
                    format!(
                        "export not finished after {}s{detail}",
                        self.config.job_timeout.as_secs()
                    ),
                )
                .into());
            }

            self.cancellable(tokio::time::sleep(wait.min(deadline - now))).await?;
            wait = self.config.poll_interval;

            match self.cancellable(self.api.poll_export(project)).await? {
                Ok(ExportStatus::Finished) => return Ok(()),
                Ok(ExportStatus::Failed) => {
                    return Err(JobFailure::new(
                        ErrorKind::RemoteExportFailed,
                        "remote export reported failed",
                    )
                    .into());
                }
                Ok(status) => {
                    debug!(?status, "Export not ready yet");
                }
                Err(
                    e @ (ApiError::Auth(_) | ApiError::NotFound(_) | ApiError::PermissionDenied(_)),
                ) => return Err(e.into()),
                Err(e @ ApiError::RateLimited { .. }) => {
                    wait = wait.max(e.retry_after().unwrap_or_default());
                    warn!(wait_secs = wait.as_secs(), "Export status poll rate limited");
                    last_error = Some(e);
                }
                Err(e) => {
                    debug!(error = %e, "Poll failed, will poll again");
                    last_error = Some(e);
                }
            }
        }
    }

    /// Stream the archive to `partial`, hashing as it goes.
    ///
    /// A transient failure mid-stream re-requests the rest of the same export
    /// from the current offset, up to [`MAX_DOWNLOAD_RESUMES`] times. A server
    /// that ignores the range sends the whole archive again, and the partial
    /// file starts over.
    async fn download_to_file(
        &self,
        project: &ProjectRef,
        partial: &Path,
        metrics: &ExportMetrics,
    ) -> Result<DownloadedArchive, AttemptError> {
        let mut download = self
            .cancellable(self.api.download_archive(project, 0))
            .await??;
        let expected_size = download.expected_size;
        let expected_sha256 = download.expected_sha256.clone();

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| JobFailure::disk("create partial archive", e))?;
        let mut hasher = Sha256::new();
        let mut progress = DownloadProgress::new(expected_size);
        let mut resumes = 0;

        loop {
            if download.offset != progress.bytes_downloaded {
                if download.offset != 0 {
                    return Err(JobFailure::new(
                        ErrorKind::ProtocolError,
                        format!(
                            "server resumed at byte {} instead of {}",
                            download.offset, progress.bytes_downloaded
                        ),
                    )
                    .into());
                }
                debug!("Range ignored by server, restarting download");
                file.set_len(0)
                    .await
                    .map_err(|e| JobFailure::disk("truncate partial archive", e))?;
                file.seek(SeekFrom::Start(0))
                    .await
                    .map_err(|e| JobFailure::disk("rewind partial archive", e))?;
                hasher = Sha256::new();
                progress = DownloadProgress::new(expected_size);
            }

            match self
                .copy_chunks(&mut download, &mut file, &mut hasher, &mut progress, metrics)
                .await
            {
                Ok(()) => break,
                Err(e)
                    if e.failure.kind == ErrorKind::TransientNetworkError
                        && resumes < MAX_DOWNLOAD_RESUMES =>
                {
                    resumes += 1;
                    warn!(
                        offset = progress.bytes_downloaded,
                        resume = resumes,
                        error = %e.failure,
                        "Download interrupted, requesting remaining bytes"
                    );
                    download = self
                        .cancellable(self.api.download_archive(project, progress.bytes_downloaded))
                        .await??;
                }
                Err(e) => return Err(e),
            }
        }

        file.flush()
            .await
            .map_err(|e| JobFailure::disk("flush archive", e))?;
        file.sync_all()
            .await
            .map_err(|e| JobFailure::disk("sync archive", e))?;
        drop(file);

        Ok(DownloadedArchive {
            sha256: hex::encode(hasher.finalize()),
            bytes: progress.bytes_downloaded,
            expected_size,
            expected_sha256,
        })
    }

    /// Append every chunk of `download` to `file`
    async fn copy_chunks(
        &self,
        download: &mut ArchiveDownload,
        file: &mut tokio::fs::File,
        hasher: &mut Sha256,
        progress: &mut DownloadProgress,
        metrics: &ExportMetrics,
    ) -> Result<(), AttemptError> {
        loop {
            let next = self
                .cancellable(tokio::time::timeout(
                    self.config.chunk_timeout,
                    download.stream.next(),
                ))
                .await?;
            let chunk = match next {
                Err(_) => {
                    return Err(JobFailure::new(
                        ErrorKind::TransientNetworkError,
                        format!(
                            "download stalled for {}s after {} bytes",
                            self.config.chunk_timeout.as_secs(),
                            progress.bytes_downloaded
                        ),
                    )
                    .into());
                }
                Ok(None) => return Ok(()),
                Ok(Some(chunk)) => chunk?,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| JobFailure::disk("write archive", e))?;
            hasher.update(&chunk);
            progress.update(chunk.len() as u64);
            metrics.record_bytes(chunk.len() as u64);

            if progress.should_emit_update() {
                info!("{}", progress.format_progress());
                progress.mark_emitted();
            }
        }
    }

    /// Move the verified archive into place and record it in the ledger
    async fn commit(
        &self,
        project: &ProjectRef,
        partial: &Path,
        archive: VerifiedArchive,
    ) -> Result<VerifiedArchive, AttemptError> {
        let target = self.layout.archive_path(project);
        if let Err(e) = tokio::fs::rename(partial, &target).await {
            remove_partial(partial).await;
            return Err(JobFailure::disk("rename archive into place", e).into());
        }
        sync_dir(&self.layout.projects_dir());

        let entry = LedgerEntry::new(project.clone(), archive.sha256.clone(), archive.bytes);
        self.ledger
            .append(entry)
            .await
            .map_err(|e| JobFailure::disk("record completion in ledger", e))?;
        Ok(archive)
    }

    async fn advance(&self, job: &mut ExportJob, next: JobState) -> Result<(), AttemptError> {
        let from = job.transition(next)?;
        self.emit(job, from).await;
        Ok(())
    }

    async fn emit(&self, job: &ExportJob, from: JobState) {
        self.reports
            .send(ReportEvent::Transition {
                project: job.project.clone(),
                from,
                to: job.state,
                attempt: job.attempt_count,
            })
            .await;
    }

    /// Race `fut` against cancellation of the shutdown scope
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, AttemptError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                Err(JobFailure::cancelled(self.cancel_reason()).into())
            }
            output = fut => Ok(output),
        }
    }

    fn cancel_reason(&self) -> String {
        self.shutdown
            .reason()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "cancelled".to_string())
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial archive"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial archive"),
    }
}
