//! Validation subcommand
//!
//! Checks the configuration, that every instance has a credential, and the
//! integrity of the resume ledger. With `--online` each token is also checked
//! against its instance.

use super::secrets::load_inputs;
use super::{Cli, CliError};
use crate::client::ExportApi;
use crate::orchestrator::gitlab_client_factory;
use crate::output::ledger_path;
use crate::resume::ResumeLedger;
use clap::Parser;
use tracing::{error, info};

/// Validate command arguments
#[derive(Parser, Debug, Default)]
pub struct ValidateArgs {
    /// Skip the credential check (no vault password needed)
    #[arg(long, default_value_t = false)]
    pub skip_credentials: bool,

    /// Call each instance with its token
    #[arg(long, default_value_t = false, conflicts_with = "skip_credentials")]
    pub online: bool,
}

impl ValidateArgs {
    /// Execute the validation command
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let inputs = load_inputs(cli, &mut std::io::stdin().lock(), !self.skip_credentials)?;
        println!(
            "Configuration OK: {} instance(s), max {} concurrent export(s)",
            inputs.instances.len(),
            inputs.settings.max_concurrent_exports
        );

        let mut problems = 0usize;
        if let Some(credentials) = &inputs.credentials {
            let factory = gitlab_client_factory();
            for instance in &inputs.instances {
                let token = match credentials.token_for(instance) {
                    Ok(token) => token,
                    Err(e) => {
                        println!("  - {}: {}", instance.name, e);
                        problems += 1;
                        continue;
                    }
                };
                if !self.online {
                    println!("  - {}: credential present", instance.name);
                    continue;
                }
                let checked = match factory(instance, &token, &inputs.settings) {
                    Ok(client) => client.validate().await,
                    Err(e) => Err(e),
                };
                match checked {
                    Ok(info) => println!(
                        "  - {}: authenticated as {} (GitLab {})",
                        instance.name,
                        info.username,
                        info.version.as_deref().unwrap_or("unknown")
                    ),
                    Err(e) => {
                        error!(instance = %instance.name, error = %e, "Instance check failed");
                        println!("  - {}: {}", instance.name, e);
                        problems += 1;
                    }
                }
            }
        }

        let ledger = ledger_path(&cli.output_dir);
        if ledger.exists() {
            let stats = ResumeLedger::inspect(&ledger)?;
            println!(
                "Ledger {}: {} completed project(s), {} duplicate(s), {} torn line(s)",
                ledger.display(),
                stats.entries,
                stats.duplicates,
                stats.torn_lines
            );
            if stats.needs_compaction() {
                info!("Ledger will be compacted on the next export run");
            }
        } else {
            println!("No ledger at {}", ledger.display());
        }

        if problems > 0 {
            return Err(CliError::InvalidArgument(format!(
                "{problems} instance(s) failed validation"
            )));
        }
        println!("Validation passed");
        Ok(())
    }
}
