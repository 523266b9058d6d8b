//! Resume ledger durability across runs

use crate::support::{
    credentials, instance, instance_report, ledger_lines, orchestrator, settings, FakeGitLab,
};
use gitlab_backup::output::ledger_path;
use gitlab_backup::resume::{LedgerEntry, ResumeLedger, LEDGER_VERSION};
use gitlab_backup::shutdown::ShutdownCoordinator;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test(start_paused = true)]
async fn test_torn_tail_is_dropped_and_compacted() {
    let temp = TempDir::new().unwrap();
    let first = [Arc::new(FakeGitLab::new("prod", 3))];
    orchestrator(temp.path(), settings(2), &first, ShutdownCoordinator::shared())
        .run(&[instance("prod")], &credentials(&["prod"]))
        .await
        .unwrap();

    // Simulate a crash in the middle of an append.
    let path = ledger_path(temp.path());
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"version":1,"project":{"instance_na"#).unwrap();
    drop(file);

    let stats = ResumeLedger::inspect(&path).unwrap();
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.torn_lines, 1);

    let second = [Arc::new(FakeGitLab::new("prod", 3))];
    let report = orchestrator(temp.path(), settings(2), &second, ShutdownCoordinator::shared())
        .run(&[instance("prod")], &credentials(&["prod"]))
        .await
        .unwrap();

    assert_eq!(instance_report(&report, "prod").totals.skipped, 3);
    assert_eq!(second[0].total_triggers(), 0);
    let stats = ResumeLedger::inspect(&path).unwrap();
    assert_eq!(stats.torn_lines, 0);
    assert_eq!(ledger_lines(temp.path()).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_entries_record_checksum_and_size() {
    let temp = TempDir::new().unwrap();
    let fakes = [Arc::new(FakeGitLab::new("prod", 1))];
    orchestrator(temp.path(), settings(1), &fakes, ShutdownCoordinator::shared())
        .run(&[instance("prod")], &credentials(&["prod"]))
        .await
        .unwrap();

    let lines = ledger_lines(temp.path());
    assert_eq!(lines.len(), 1);
    let entry: LedgerEntry = serde_json::from_str(&lines[0]).unwrap();
    let body = crate::support::archive_body(1);

    assert_eq!(entry.version, LEDGER_VERSION);
    assert_eq!(entry.project.project_id, 1);
    assert_eq!(entry.project.instance_name, "prod");
    assert_eq!(entry.bytes, body.len() as u64);
    assert_eq!(entry.archive_checksum, {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(&body))
    });
}

#[tokio::test(start_paused = true)]
async fn test_ledger_is_shared_across_instances() {
    let temp = TempDir::new().unwrap();
    let fakes = [
        Arc::new(FakeGitLab::new("prod", 2)),
        Arc::new(FakeGitLab::new("lab", 2)),
    ];
    orchestrator(temp.path(), settings(2), &fakes, ShutdownCoordinator::shared())
        .run(
            &[instance("prod"), instance("lab")],
            &credentials(&["prod", "lab"]),
        )
        .await
        .unwrap();

    let ledger = ResumeLedger::open(ledger_path(temp.path())).unwrap();
    assert_eq!(ledger.completed().len(), 4);
    // Same project id on different instances is a different project.
    assert!(ledger
        .completed()
        .iter()
        .any(|k| k.instance_name == "lab" && k.project_id == 1));
}
