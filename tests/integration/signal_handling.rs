//! Cancellation, error budget and instance aborts

use crate::support::{
    credentials, instance, instance_report, ledger_lines, orchestrator, partial_files, settings,
    FakeGitLab, Step,
};
use chrono::Utc;
use gitlab_backup::client::{ApiError, ExportApi};
use gitlab_backup::config::{ErrorBudgetConfig, ExportSettings};
use gitlab_backup::export::{ErrorKind, JobRunner, RunStatus, RunnerConfig, Scheduler};
use gitlab_backup::output::{ledger_path, RunLayout};
use gitlab_backup::report::{Outcome, ReportAggregator};
use gitlab_backup::resume::ResumeLedger;
use gitlab_backup::shutdown::{CancelReason, ShutdownCoordinator};
use gitlab_backup::ProjectRef;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test(start_paused = true)]
async fn test_signal_drains_in_flight_jobs_and_stops_admission() {
    let temp = TempDir::new().unwrap();
    let mut fake = FakeGitLab::new("prod", 6);
    for id in 1..=6 {
        fake = fake.with_script(id, vec![Step::NeverFinishes]);
    }
    let fake = Arc::new(fake);
    let shutdown = ShutdownCoordinator::shared();
    let settings = ExportSettings {
        timeout_minutes: 10,
        ..settings(2)
    };

    tokio::spawn({
        let shutdown = Arc::clone(&shutdown);
        async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            shutdown.request_shutdown();
        }
    });

    let report = orchestrator(temp.path(), settings, std::slice::from_ref(&fake), shutdown)
        .run(&[instance("prod")], &credentials(&["prod"]))
        .await
        .unwrap();
    let prod = instance_report(&report, "prod");

    assert_eq!(prod.status, RunStatus::Cancelled);
    assert_eq!(prod.records.len(), 2);
    assert!(prod
        .records
        .iter()
        .all(|r| r.error_kind == Some(ErrorKind::Cancelled)));
    assert_eq!(prod.totals.not_started, 4);
    assert_eq!(fake.total_triggers(), 2);
    assert!(ledger_lines(temp.path()).is_empty());
    assert!(partial_files(&prod.run_dir.join("projects")).is_empty());
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_runs_nothing() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 3));
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();

    let report = orchestrator(temp.path(), settings(2), std::slice::from_ref(&fake), shutdown)
        .run(&[instance("prod")], &credentials(&["prod"]))
        .await
        .unwrap();

    assert_eq!(instance_report(&report, "prod").status, RunStatus::Cancelled);
    assert_eq!(fake.total_triggers(), 0);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_budget_stops_run() {
    let temp = TempDir::new().unwrap();
    let mut failing = FakeGitLab::new("prod", 6);
    for id in 1..=6 {
        failing = failing.with_script(
            id,
            vec![Step::TriggerError(ApiError::NotFound("404".into()))],
        );
    }
    let fakes = [Arc::new(failing), Arc::new(FakeGitLab::new("lab", 2))];
    let settings = ExportSettings {
        error_budget: Some(ErrorBudgetConfig {
            max_failure_ratio: 0.5,
            min_jobs: 2,
        }),
        ..settings(1)
    };

    let report = orchestrator(temp.path(), settings, &fakes, ShutdownCoordinator::shared())
        .run(
            &[instance("prod"), instance("lab")],
            &credentials(&["prod", "lab"]),
        )
        .await
        .unwrap();

    let prod = instance_report(&report, "prod");
    assert_eq!(prod.status, RunStatus::BudgetExceeded);
    assert_eq!(prod.totals.failed, 2);
    assert_eq!(prod.totals.not_started, 4);

    let lab = instance_report(&report, "lab");
    assert_eq!(lab.status, RunStatus::BudgetExceeded);
    assert_eq!(fakes[1].total_triggers(), 0);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_disk_errors_abort_instance() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_path_buf();
    let fake: Arc<dyn ExportApi> = Arc::new(FakeGitLab::new("prod", 5));

    let layout = Arc::new(RunLayout::new(root.clone(), "prod", Utc::now()));
    layout.ensure_directories().unwrap();
    let projects: Vec<ProjectRef> = (1..=5)
        .map(|id| ProjectRef::new("prod", id, format!("group/project-{id}")))
        .collect();
    // A directory where the partial file should go makes every write fail.
    for project in &projects[..3] {
        std::fs::create_dir_all(layout.partial_path(project)).unwrap();
    }

    let ledger = ResumeLedger::open(ledger_path(&root)).unwrap();
    let completed = Arc::new(ledger.completed().clone());
    let writer = ledger.into_writer().await.unwrap();
    let aggregator = ReportAggregator::spawn(
        "prod",
        layout.run_dir().to_path_buf(),
        layout.error_log_path(),
        Utc::now(),
    );
    let root_scope = ShutdownCoordinator::shared();
    let scope = root_scope.child();
    let runner = Arc::new(JobRunner::new(
        fake,
        Arc::clone(&layout),
        completed,
        writer.handle(),
        aggregator.sender(),
        Arc::clone(&scope),
        RunnerConfig {
            poll_interval: Duration::from_secs(1),
            ..RunnerConfig::default()
        },
    ));

    let outcome = Scheduler::new(runner).run(projects, 1).await;

    assert_eq!(outcome.status, RunStatus::InstanceAborted);
    assert_eq!(outcome.records.len(), 3);
    assert!(outcome
        .records
        .iter()
        .all(|r| r.outcome == Outcome::Failed && r.error_kind == Some(ErrorKind::DiskError)));
    assert_eq!(outcome.not_started(), 2);
    assert_eq!(scope.reason(), Some(CancelReason::InstanceAborted));
    assert!(!root_scope.is_cancelled());

    let report = aggregator
        .finish(outcome.status, outcome.total, layout.report_path())
        .await
        .unwrap();
    assert_eq!(report.failures.len(), 3);
    writer.close().await.unwrap();
}
