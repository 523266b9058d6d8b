//! Vault-backed runs

use crate::support::{instance, instance_report, orchestrator, settings, FakeGitLab};
use gitlab_backup::orchestrator::{CredentialSource, OrchestratorError};
use gitlab_backup::shutdown::ShutdownCoordinator;
use gitlab_backup::vault::format::KdfCost;
use gitlab_backup::vault::{CredentialVault, VaultError};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tempfile::TempDir;

fn fast_cost() -> KdfCost {
    KdfCost {
        iterations: 1,
        memory_kib: 64,
        parallelism: 1,
    }
}

fn password(p: &str) -> SecretString {
    SecretString::from(p.to_string())
}

#[tokio::test(start_paused = true)]
async fn test_export_with_tokens_from_vault() {
    let temp = TempDir::new().unwrap();
    let vault = CredentialVault::new(temp.path().join("credentials.enc"));
    vault
        .create_with_cost(&password("pw"), fast_cost())
        .unwrap()
        .store("prod", SecretString::from("glpat-secret".to_string()))
        .unwrap();

    let unlocked = vault.unlock(&password("pw")).unwrap();
    assert_eq!(unlocked.fetch("prod").unwrap().expose_secret(), "glpat-secret");

    let fakes = [Arc::new(FakeGitLab::new("prod", 2))];
    let output = temp.path().join("exports");
    let report = orchestrator(&output, settings(2), &fakes, ShutdownCoordinator::shared())
        .run(&[instance("prod")], &CredentialSource::Vault(unlocked))
        .await
        .unwrap();

    assert_eq!(instance_report(&report, "prod").totals.completed, 2);

    // The token never reaches any file the run produced.
    let report_json = serde_json::to_string(&report).unwrap();
    assert!(!report_json.contains("glpat-secret"));
}

#[tokio::test]
async fn test_missing_vault_entry_is_reported_by_instance() {
    let temp = TempDir::new().unwrap();
    let vault = CredentialVault::new(temp.path().join("credentials.enc"));
    let unlocked = vault.create_with_cost(&password("pw"), fast_cost()).unwrap();

    let fakes = [Arc::new(FakeGitLab::new("prod", 1))];
    let err = orchestrator(temp.path(), settings(1), &fakes, ShutdownCoordinator::shared())
        .run(&[instance("prod")], &CredentialSource::Vault(unlocked))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::MissingCredential { ref instance } if instance == "prod"
    ));
}

#[test]
fn test_wrong_password_returns_nothing() {
    let temp = TempDir::new().unwrap();
    let vault = CredentialVault::new(temp.path().join("credentials.enc"));
    vault
        .create_with_cost(&password("right"), fast_cost())
        .unwrap()
        .store("prod", SecretString::from("glpat-secret".to_string()))
        .unwrap();

    assert!(matches!(
        vault.unlock(&password("wrong")),
        Err(VaultError::WrongPassword)
    ));
    let on_disk = std::fs::read(vault.path()).unwrap();
    assert!(!String::from_utf8_lossy(&on_disk).contains("glpat-secret"));
}
