//! Concurrency bound and scheduler behavior

use crate::support::{credentials, instance, instance_report, orchestrator, settings, FakeGitLab};
use gitlab_backup::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use tempfile::TempDir;

async fn peak_for(projects: u64, max_concurrent: usize) -> usize {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", projects));

    let report = orchestrator(
        temp.path(),
        settings(max_concurrent),
        std::slice::from_ref(&fake),
        ShutdownCoordinator::shared(),
    )
    .run(&[instance("prod")], &credentials(&["prod"]))
    .await
    .unwrap();

    assert_eq!(
        instance_report(&report, "prod").totals.completed,
        projects as usize
    );
    fake.peak_running()
}

#[tokio::test(start_paused = true)]
async fn test_running_exports_never_exceed_limit() {
    for max in [1, 2, 4] {
        let peak = peak_for(10, max).await;
        assert!(peak <= max, "peak {peak} exceeded limit {max}");
        assert!(peak >= 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_limit_larger_than_project_count() {
    let peak = peak_for(3, 8).await;
    assert!(peak <= 3);
}

#[tokio::test(start_paused = true)]
async fn test_single_slot_runs_sequentially() {
    assert_eq!(peak_for(5, 1).await, 1);
}
