//! Command-line behavior of the binary

use assert_cmd::Command;
use std::fs;
use tempfile::TempDir;

const CONFIG: &str = r#"{
    "instances": [{"name": "prod", "url": "https://gitlab.example.com"}],
    "export_settings": {"max_concurrent_exports": 2}
}"#;

fn command(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("gitlab-backup").unwrap();
    cmd.current_dir(temp.path())
        .env_remove("GITLAB_USE_ENV_VARS")
        .env_remove("GITLAB_BACKUP_VAULT_PASSWORD");
    cmd
}

#[test]
fn test_help_lists_commands() {
    let temp = TempDir::new().unwrap();
    let output = command(&temp).arg("--help").assert().success().get_output().clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("export"));
    assert!(stdout.contains("vault"));
    assert!(stdout.contains("validate"));
}

#[test]
fn test_validate_without_credentials() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("config.json"), CONFIG).unwrap();

    let output = command(&temp)
        .args(["validate", "--skip-credentials"])
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration OK: 1 instance(s)"));
    assert!(stdout.contains("No ledger"));
}

#[test]
fn test_invalid_config_exits_with_two() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("config.json"),
        r#"{"instances": [], "export_settings": {}}"#,
    )
    .unwrap();

    command(&temp)
        .args(["validate", "--skip-credentials"])
        .assert()
        .code(2);
}

#[test]
fn test_unknown_config_key_exits_with_two() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("config.json"),
        r#"{"instances": [{"name": "prod", "url": "https://a"}], "export_settings": {"max_parallel": 3}}"#,
    )
    .unwrap();

    command(&temp).args(["export"]).assert().code(2);
}

#[test]
fn test_export_without_password_exits_with_two() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("config.json"), CONFIG).unwrap();

    command(&temp).args(["export", "--no-progress"]).assert().code(2);
}

#[test]
fn test_max_concurrent_out_of_range_is_rejected() {
    let temp = TempDir::new().unwrap();
    command(&temp)
        .args(["export", "--max-concurrent", "64"])
        .assert()
        .failure();
}

#[test]
fn test_vault_init_set_list() {
    let temp = TempDir::new().unwrap();

    command(&temp)
        .args(["vault", "init", "--password-stdin"])
        .write_stdin("hunter2\n")
        .assert()
        .success();
    assert!(temp.path().join("credentials.enc").exists());

    command(&temp)
        .args(["vault", "set", "prod", "--password-stdin"])
        .write_stdin("hunter2\nglpat-abc123\n")
        .assert()
        .success();

    let output = command(&temp)
        .args(["vault", "list"])
        .env("GITLAB_BACKUP_VAULT_PASSWORD", "hunter2")
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("prod"));
    assert!(!stdout.contains("glpat-abc123"));

    let raw = fs::read(temp.path().join("credentials.enc")).unwrap();
    assert!(!String::from_utf8_lossy(&raw).contains("glpat-abc123"));

    command(&temp)
        .args(["vault", "list", "--password-stdin"])
        .write_stdin("wrong\n")
        .assert()
        .code(2);
}

#[test]
fn test_env_mode_without_instances_exits_with_two() {
    let temp = TempDir::new().unwrap();
    command(&temp)
        .args(["export", "--no-progress"])
        .env("GITLAB_USE_ENV_VARS", "true")
        .assert()
        .code(2);
}
