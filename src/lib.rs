//! # GitLab Backup Library
//!
//! Concurrent, resumable backups of one or more GitLab instances through the
//! server-side project export API.
//!
//! ## Features
//!
//! - **Export Orchestration**: Every project is driven through
//!   trigger → poll → download → verify under a global concurrency bound
//! - **Resume Capability**: A durable ledger of completed projects lets an
//!   interrupted run pick up where it stopped without re-downloading archives
//! - **Retry Policy**: Transient network failures, rate limits, export timeouts
//!   and checksum mismatches are retried with capped exponential backoff
//! - **Encrypted Credentials**: Access tokens live in an Argon2id/XChaCha20-Poly1305
//!   vault and only exist in plaintext in process memory
//! - **Structured Reports**: A JSON summary and an append-only error log per instance
//!
//! ## Quick Start
//!
//! ```no_run
//! use gitlab_backup::config::Config;
//! use gitlab_backup::orchestrator::{CredentialSource, Orchestrator};
//! use gitlab_backup::shutdown::ShutdownCoordinator;
//! use gitlab_backup::vault::CredentialVault;
//! use secrecy::SecretString;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("config.json")?;
//! let password = SecretString::from("correct horse battery staple".to_string());
//! let vault = CredentialVault::new("credentials.enc").unlock(&password)?;
//!
//! let orchestrator = Orchestrator::new(
//!     config.settings.clone(),
//!     "exports",
//!     ShutdownCoordinator::shared(),
//! );
//! let report = orchestrator
//!     .run(&config.instances, &CredentialSource::Vault(vault))
//!     .await?;
//! std::process::exit(report.exit_code());
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`vault`] - Encrypted-at-rest credential store
//! - [`client`] - GitLab REST adapter behind the [`client::ExportApi`] trait
//! - [`resume`] - Append-only ledger of completed exports
//! - [`export`] - Export job state machine, retry policy and scheduler
//! - [`report`] - Single-writer report aggregation
//! - [`orchestrator`] - Wires instances, credentials, ledger and reports together

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// CLI command implementations
pub mod cli;

/// GitLab API client and pagination
pub mod client;

/// Configuration loading and validation
pub mod config;

/// Export job state machine, retry policy and scheduler
pub mod export;

/// Observability metrics
pub mod metrics;

/// Run orchestration across instances
pub mod orchestrator;

/// Output directory layout and atomic file helpers
pub mod output;

/// Report aggregation
pub mod report;

/// Resume ledger
pub mod resume;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

/// Encrypted credential vault
pub mod vault;

/// One GitLab deployment with its own base URL and credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique instance name, used for output directories and reports
    pub name: String,
    /// Base URL (e.g., "https://gitlab.example.com"), without trailing slash
    pub base_url: String,
    /// Opaque handle into the credential vault
    pub secret_ref: String,
}

impl Instance {
    /// Create an instance, normalizing the base URL.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        secret_ref: impl Into<String>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_ref: secret_ref.into(),
        }
    }
}

/// A project discovered on an instance.
///
/// Identity is `(instance_name, project_id)`; `path` is informational and may
/// change between runs when a project is renamed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectRef {
    /// Owning instance name
    pub instance_name: String,
    /// Numeric project id, stable across renames
    pub project_id: u64,
    /// Full path with namespace (e.g., "group/subgroup/project")
    pub path: String,
}

impl ProjectRef {
    /// Create a new project reference
    pub fn new(instance_name: impl Into<String>, project_id: u64, path: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            project_id,
            path: path.into(),
        }
    }

    /// Identity key used by the ledger and the scheduler
    pub fn key(&self) -> ProjectKey {
        ProjectKey {
            instance_name: self.instance_name.clone(),
            project_id: self.project_id,
        }
    }

    /// `<id>_<flattened path>`, unique per instance even when two paths
    /// flatten to the same text
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}",
            self.project_id,
            output::sanitize_component(&self.path.replace('/', "_"))
        )
    }

    /// Archive file name, flattening the namespace into one path component
    pub fn archive_file_name(&self) -> String {
        format!("{}.tar.gz", self.file_stem())
    }
}

impl fmt::Display for ProjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (#{})", self.instance_name, self.path, self.project_id)
    }
}

/// Identity of a project across runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey {
    /// Owning instance name
    pub instance_name: String,
    /// Numeric project id
    pub project_id: u64,
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.instance_name, self.project_id)
    }
}
