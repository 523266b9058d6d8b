//! End-to-end export runs against the in-memory GitLab

use crate::support::{
    archive_body, archive_name, credentials, instance, instance_report, ledger_lines,
    orchestrator, partial_files, settings, FakeGitLab, Step,
};
use gitlab_backup::client::ProjectResource;
use gitlab_backup::export::{ErrorKind, RunStatus};
use gitlab_backup::report::{InstanceReport, Outcome, RunReport};
use gitlab_backup::shutdown::ShutdownCoordinator;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

async fn run_once(root: &Path, fake: &Arc<FakeGitLab>) -> RunReport {
    orchestrator(
        root,
        settings(2),
        std::slice::from_ref(fake),
        ShutdownCoordinator::shared(),
    )
    .run(&[instance("prod")], &credentials(&["prod"]))
    .await
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_all_projects_succeed() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 3));

    let report = run_once(temp.path(), &fake).await;
    let prod = instance_report(&report, "prod");

    assert_eq!(prod.status, RunStatus::Finished);
    assert_eq!(prod.totals.total, 3);
    assert_eq!(prod.totals.completed, 3);
    assert_eq!(prod.totals.failed, 0);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(ledger_lines(temp.path()).len(), 3);

    let projects_dir = prod.run_dir.join("projects");
    for id in 1..=3 {
        let archive = std::fs::read(projects_dir.join(archive_name(id))).unwrap();
        assert_eq!(archive, archive_body(id));
    }
    assert!(partial_files(&projects_dir).is_empty());

    let written: InstanceReport = serde_json::from_str(
        &std::fs::read_to_string(prod.run_dir.join("export_report.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(written.totals.completed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_project_list_is_written_across_pages() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(
        FakeGitLab::new("prod", 5)
            .with_page_size(2)
            .with_archived_project(99),
    );

    let report = run_once(temp.path(), &fake).await;
    let prod = instance_report(&report, "prod");

    let list: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(prod.run_dir.join("project_list.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(list["instance"], "prod");
    assert_eq!(list["count"], 5);
    assert_eq!(list["projects"].as_array().unwrap().len(), 5);
    assert_eq!(fake.triggers(99), 0);
    assert_eq!(prod.totals.completed, 5);
}

#[tokio::test(start_paused = true)]
async fn test_export_timeout_fails_one_project_only() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeGitLab::new("prod", 3).with_script(
        2,
        vec![Step::NeverFinishes, Step::NeverFinishes, Step::NeverFinishes],
    ));

    let report = run_once(temp.path(), &fake).await;
    let prod = instance_report(&report, "prod");

    assert_eq!(prod.totals.completed, 2);
    assert_eq!(prod.totals.failed, 1);
    assert_eq!(report.exit_code(), 1);

    let failure = report.failures().next().unwrap();
    assert_eq!(failure.project.project_id, 2);
    assert_eq!(failure.error_kind, ErrorKind::ExportTimeout);
    assert_eq!(failure.attempt_count, 3);
    assert_eq!(fake.triggers(2), 3);

    let log = std::fs::read_to_string(prod.run_dir.join("errors.log")).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("group/project-2"));
    assert!(log.contains("ExportTimeout"));

    assert_eq!(ledger_lines(temp.path()).len(), 2);
    assert!(!prod.run_dir.join("projects").join(archive_name(2)).exists());
}

#[tokio::test(start_paused = true)]
async fn test_rerun_skips_completed_and_exports_new_project() {
    let temp = TempDir::new().unwrap();
    let first = Arc::new(FakeGitLab::new("prod", 3));
    let report = run_once(temp.path(), &first).await;
    assert_eq!(instance_report(&report, "prod").totals.completed, 3);

    let second = Arc::new(FakeGitLab::new("prod", 4));
    let report = run_once(temp.path(), &second).await;
    let prod = instance_report(&report, "prod");

    assert_eq!(prod.totals.completed, 1);
    assert_eq!(prod.totals.skipped, 3);
    assert_eq!(second.total_triggers(), 1);
    assert_eq!(second.triggers(4), 1);
    assert_eq!(ledger_lines(temp.path()).len(), 4);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resume_is_idempotent() {
    let temp = TempDir::new().unwrap();
    run_once(temp.path(), &Arc::new(FakeGitLab::new("prod", 3))).await;

    let again = Arc::new(FakeGitLab::new("prod", 3));
    let report = run_once(temp.path(), &again).await;
    let prod = instance_report(&report, "prod");

    assert_eq!(prod.totals.skipped, 3);
    assert_eq!(prod.totals.completed, 0);
    assert_eq!(again.total_triggers(), 0);
    assert_eq!(ledger_lines(temp.path()).len(), 3);
    assert!(prod
        .records
        .iter()
        .all(|r| r.outcome == Outcome::Skipped && r.attempt_count == 0));
}

#[tokio::test(start_paused = true)]
async fn test_instances_run_in_order_with_separate_directories() {
    let temp = TempDir::new().unwrap();
    let fakes = [
        Arc::new(FakeGitLab::new("prod", 2)),
        Arc::new(FakeGitLab::new("lab", 1)),
    ];

    let report = orchestrator(temp.path(), settings(2), &fakes, ShutdownCoordinator::shared())
        .run(
            &[instance("prod"), instance("lab")],
            &credentials(&["prod", "lab"]),
        )
        .await
        .unwrap();

    let names: Vec<_> = report.instances.iter().map(|i| i.instance.as_str()).collect();
    assert_eq!(names, ["prod", "lab"]);
    assert_eq!(report.totals.completed, 3);
    assert!(instance_report(&report, "prod").run_dir.starts_with(temp.path().join("prod")));
    assert!(instance_report(&report, "lab").run_dir.starts_with(temp.path().join("lab")));

    let run_reports: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("run_report_"))
        .collect();
    assert_eq!(run_reports.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_paths_that_flatten_alike_keep_separate_archives() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(
        FakeGitLab::new("prod", 0)
            .with_project(1, "a/b_c")
            .with_project(2, "a_b/c"),
    );

    let report = run_once(temp.path(), &fake).await;
    let prod = instance_report(&report, "prod");
    let projects_dir = prod.run_dir.join("projects");

    assert_eq!(prod.totals.completed, 2);
    assert_eq!(
        std::fs::read(projects_dir.join("1_a_b_c.tar.gz")).unwrap(),
        archive_body(1)
    );
    assert_eq!(
        std::fs::read(projects_dir.join("2_a_b_c.tar.gz")).unwrap(),
        archive_body(2)
    );
    assert_eq!(ledger_lines(temp.path()).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unwritable_instance_directory_aborts_that_instance_only() {
    let temp = TempDir::new().unwrap();
    // A plain file where the instance directory should go
    std::fs::write(temp.path().join("lab"), b"not a directory").unwrap();
    let fakes = [
        Arc::new(FakeGitLab::new("prod", 2)),
        Arc::new(FakeGitLab::new("lab", 1)),
    ];

    let report = orchestrator(temp.path(), settings(2), &fakes, ShutdownCoordinator::shared())
        .run(
            &[instance("prod"), instance("lab")],
            &credentials(&["prod", "lab"]),
        )
        .await
        .unwrap();

    let prod = instance_report(&report, "prod");
    assert_eq!(prod.status, RunStatus::Finished);
    assert_eq!(prod.totals.completed, 2);

    let lab = instance_report(&report, "lab");
    assert_eq!(lab.status, RunStatus::InstanceAborted);
    assert!(lab.error.as_deref().is_some_and(|e| e.contains("output error")));
    assert_eq!(fakes[1].total_triggers(), 0);

    assert_eq!(report.exit_code(), 1);
    let run_reports = std::fs::read_dir(temp.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("run_report_"))
        .count();
    assert_eq!(run_reports, 1);
}

#[tokio::test(start_paused = true)]
async fn test_side_exports_are_written_after_archives() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(
        FakeGitLab::new("prod", 2)
            .with_resource(
                1,
                ProjectResource::Issues,
                vec![serde_json::json!({"iid": 1, "title": "broken build"})],
            )
            .with_resource(
                1,
                ProjectResource::WikiPages,
                vec![serde_json::json!({"slug": "home", "title": "Home", "content": "hello"})],
            )
            .with_resource(
                2,
                ProjectResource::Snippets,
                vec![serde_json::json!({"id": 8, "file_name": "notes.txt"})],
            ),
    );

    let report = run_once(temp.path(), &fake).await;
    let prod = instance_report(&report, "prod");

    assert_eq!(prod.totals.completed, 2);
    assert_eq!(prod.side_exports.failed, 0);
    assert_eq!(prod.side_exports.items, 3);
    assert_eq!(report.side_exports.items, 3);

    let issues: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(prod.run_dir.join("metadata/1_group_project-1/issues.json"))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(issues[0]["title"], "broken build");
    assert_eq!(
        std::fs::read_to_string(prod.run_dir.join("wikis/1_group_project-1/home.md")).unwrap(),
        "hello"
    );
    assert_eq!(
        std::fs::read_to_string(prod.run_dir.join("snippets/2_group_project-2/8_notes.txt"))
            .unwrap(),
        "snippet 8 of project 2"
    );
    // Empty collections leave no files behind
    assert!(!prod.run_dir.join("metadata/2_group_project-2").exists());
}
