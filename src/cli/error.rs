//! CLI error types and conversions

use crate::config::ConfigError;
use crate::metrics::MetricsError;
use crate::orchestrator::{OrchestratorError, EXIT_FATAL};
use crate::report::ReportError;
use crate::resume::LedgerError;
use crate::vault::VaultError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Vault error
    #[error("vault error: {0}")]
    VaultError(#[from] VaultError),

    /// Ledger error
    #[error("ledger error: {0}")]
    LedgerError(#[from] LedgerError),

    /// Run aborted before or during scheduling
    #[error(transparent)]
    OrchestratorError(#[from] OrchestratorError),

    /// Report error
    #[error("report error: {0}")]
    ReportError(#[from] ReportError),

    /// Metrics exporter error
    #[error("metrics error: {0}")]
    MetricsError(#[from] MetricsError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Terminal input could not be read
    #[error("input error: {0}")]
    InputError(String),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::OrchestratorError(e) => e.exit_code(),
            CliError::ReportError(_) => 1,
            CliError::ConfigError(_)
            | CliError::VaultError(_)
            | CliError::LedgerError(_)
            | CliError::MetricsError(_)
            | CliError::InvalidArgument(_)
            | CliError::InputError(_) => EXIT_FATAL,
        }
    }
}
