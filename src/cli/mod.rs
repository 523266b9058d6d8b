//! CLI command implementations

pub mod error;
pub mod export;
pub mod secrets;
pub mod validate;
pub mod vault;

pub use error::CliError;
pub use export::ExportArgs;
pub use validate::ValidateArgs;
pub use vault::VaultCommand;

use crate::config::MAX_CONCURRENT_EXPORTS_LIMIT;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Parse and bound `--max-concurrent`
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

const MAX_CONCURRENCY: usize = MAX_CONCURRENT_EXPORTS_LIMIT;

/// GitLab backup CLI
#[derive(Parser, Debug)]
#[command(name = "gitlab-backup")]
#[command(about = "Back up GitLab instances through the project export API", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file
    #[arg(long, global = true, default_value = "config.json")]
    pub config: PathBuf,

    /// Root directory for archives, reports and the resume ledger
    #[arg(long, global = true, default_value = "exports")]
    pub output_dir: PathBuf,

    /// Encrypted credential vault
    #[arg(long, global = true, default_value = "credentials.enc")]
    pub vault: PathBuf,

    /// Read the vault password from the first line of stdin
    #[arg(long, global = true, default_value_t = false)]
    pub password_stdin: bool,

    /// Override `max_concurrent_exports` (1-32)
    #[arg(long, global = true, value_parser = parse_concurrency)]
    pub max_concurrent: Option<usize>,

    /// Serve Prometheus metrics on this address (e.g., 127.0.0.1:9090)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Export every project of the configured instances
    Export(ExportArgs),

    /// Manage the encrypted credential vault
    #[command(subcommand)]
    Vault(VaultCommand),

    /// Check configuration, credentials and the resume ledger without exporting
    Validate(ValidateArgs),
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}
