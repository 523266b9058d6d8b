//! Retry ceiling, error classification and verification failures

use crate::support::{
    archive_body, archive_name, credentials, instance, instance_report, ledger_lines,
    orchestrator, partial_files, settings, FakeGitLab, Step,
};
use gitlab_backup::client::ApiError;
use gitlab_backup::config::ExportSettings;
use gitlab_backup::export::ErrorKind;
use gitlab_backup::report::{Outcome, ReportRecord, RunReport};
use gitlab_backup::shutdown::ShutdownCoordinator;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn run(root: &Path, settings: ExportSettings, fake: &Arc<FakeGitLab>) -> RunReport {
    orchestrator(
        root,
        settings,
        std::slice::from_ref(fake),
        ShutdownCoordinator::shared(),
    )
    .run(&[instance("prod")], &credentials(&["prod"]))
    .await
    .unwrap()
}

fn record(report: &RunReport, id: u64) -> &ReportRecord {
    instance_report(report, "prod")
        .records
        .iter()
        .find(|r| r.project.project_id == id)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_retry_ceiling_is_respected() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 1).with_script(1, vec![Step::RemoteFails; 10]));

    let report = run(temp.path(), settings(1), &fake).await;

    let failed = record(&report, 1);
    assert_eq!(failed.outcome, Outcome::Failed);
    assert_eq!(failed.error_kind, Some(ErrorKind::RemoteExportFailed));
    assert_eq!(failed.attempt_count, 3);
    assert_eq!(fake.triggers(1), 3);
    assert_eq!(report.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_errors_are_not_retried() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(
        FakeGitLab::new("prod", 2)
            .with_script(1, vec![Step::TriggerError(ApiError::NotFound("404".into()))])
            .with_script(
                2,
                vec![Step::TriggerError(ApiError::PermissionDenied("403".into()))],
            ),
    );

    let report = run(temp.path(), settings(2), &fake).await;

    assert_eq!(record(&report, 1).error_kind, Some(ErrorKind::RemoteNotFound));
    assert_eq!(record(&report, 1).attempt_count, 1);
    assert_eq!(record(&report, 2).error_kind, Some(ErrorKind::PermissionDenied));
    assert_eq!(record(&report, 2).attempt_count, 1);
    assert_eq!(report.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_trigger_waits_and_succeeds() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 1).with_script(
        1,
        vec![Step::TriggerError(ApiError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        })],
    ));

    let started = tokio::time::Instant::now();
    let report = run(temp.path(), settings(1), &fake).await;

    let done = record(&report, 1);
    assert_eq!(done.outcome, Outcome::Completed);
    assert_eq!(done.attempt_count, 2);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(report.retries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_download_error_is_retried() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 1).with_script(
        1,
        vec![Step::DownloadError(ApiError::Network("connection reset".into()))],
    ));

    let report = run(temp.path(), settings(1), &fake).await;

    assert_eq!(record(&report, 1).outcome, Outcome::Completed);
    assert_eq!(fake.triggers(1), 2);
}

#[tokio::test(start_paused = true)]
async fn test_checksum_mismatch_retries_then_succeeds() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 1).with_script(1, vec![Step::CorruptArchive]));

    let report = run(temp.path(), settings(1), &fake).await;
    let prod = instance_report(&report, "prod");
    let projects_dir = prod.run_dir.join("projects");

    assert_eq!(record(&report, 1).outcome, Outcome::Completed);
    assert_eq!(record(&report, 1).attempt_count, 2);
    assert_eq!(
        std::fs::read(projects_dir.join(archive_name(1))).unwrap(),
        archive_body(1)
    );
    assert!(partial_files(&projects_dir).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_checksum_mismatch_never_leaves_an_archive() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 1).with_script(1, vec![Step::CorruptArchive; 3]));

    let report = run(temp.path(), settings(1), &fake).await;
    let prod = instance_report(&report, "prod");
    let projects_dir = prod.run_dir.join("projects");

    assert_eq!(record(&report, 1).error_kind, Some(ErrorKind::ChecksumMismatch));
    assert!(!projects_dir.join(archive_name(1)).exists());
    assert!(partial_files(&projects_dir).is_empty());
    assert!(ledger_lines(temp.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_failed_pass_recovers_failures() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 3).with_script(2, vec![Step::RemoteFails]));
    let settings = ExportSettings {
        max_attempts: 1,
        retry_failed: true,
        ..settings(2)
    };

    let report = run(temp.path(), settings, &fake).await;
    let prod = instance_report(&report, "prod");

    assert_eq!(prod.totals.total, 3);
    assert_eq!(prod.totals.completed, 3);
    assert_eq!(prod.totals.failed, 0);
    assert_eq!(prod.records.len(), 3);
    assert_eq!(fake.triggers(2), 2);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_without_retry_failed_pass_failure_stands() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 3).with_script(2, vec![Step::RemoteFails]));
    let settings = ExportSettings {
        max_attempts: 1,
        ..settings(2)
    };

    let report = run(temp.path(), settings, &fake).await;

    assert_eq!(instance_report(&report, "prod").totals.failed, 1);
    assert_eq!(fake.triggers(2), 1);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_poll_waits_for_retry_after() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 1).with_script(
        1,
        vec![Step::PollRateLimited(Duration::from_secs(30))],
    ));

    let report = run(temp.path(), settings(1), &fake).await;

    assert_eq!(record(&report, 1).outcome, Outcome::Completed);
    assert_eq!(record(&report, 1).attempt_count, 1);
    let polls = fake.poll_times(1);
    assert_eq!(polls.len(), 2);
    assert!(polls[1] - polls[0] >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_download_resumes_with_range() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 1).with_script(1, vec![Step::InterruptedDownload]));

    let report = run(temp.path(), settings(1), &fake).await;
    let projects_dir = instance_report(&report, "prod").run_dir.join("projects");

    assert_eq!(record(&report, 1).outcome, Outcome::Completed);
    assert_eq!(fake.triggers(1), 1);
    let half = (archive_body(1).len() / 2) as u64;
    assert_eq!(fake.download_offsets(1), vec![0, half]);
    assert_eq!(
        std::fs::read(projects_dir.join(archive_name(1))).unwrap(),
        archive_body(1)
    );
    assert!(partial_files(&projects_dir).is_empty());
}
