//! Vault management subcommands
//!
//! The password is read first (stdin line or environment); `set` then reads the
//! token from the next stdin line so it never appears in shell history.

use super::secrets::{read_secret_line, vault_password};
use super::{Cli, CliError};
use crate::config::env::process_env;
use crate::vault::CredentialVault;
use clap::Subcommand;
use std::io::BufRead;

/// Vault subcommands
#[derive(Subcommand, Debug)]
pub enum VaultCommand {
    /// Create an empty vault
    Init,
    /// Store or replace a token read from stdin
    Set {
        /// Entry name (an instance's `secret_ref`)
        secret_ref: String,
    },
    /// Delete a token
    Remove {
        /// Entry name
        secret_ref: String,
    },
    /// List entry names
    List,
}

impl VaultCommand {
    /// Execute against the vault named by `--vault`
    pub fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        self.execute_with(cli, &mut std::io::stdin().lock())
    }

    /// Execute reading secrets from `stdin`
    pub fn execute_with<R: BufRead>(&self, cli: &Cli, stdin: &mut R) -> Result<(), CliError> {
        let vault = CredentialVault::new(&cli.vault);
        let password = vault_password(cli.password_stdin, stdin, process_env)?;

        match self {
            VaultCommand::Init => {
                vault.create(&password)?;
                println!("Created vault at {}", vault.path().display());
            }
            VaultCommand::Set { secret_ref } => {
                let mut unlocked = vault.unlock(&password)?;
                let token = read_secret_line(stdin, "token")?;
                unlocked.store(secret_ref, token)?;
                println!("Token stored");
            }
            VaultCommand::Remove { secret_ref } => {
                let mut unlocked = vault.unlock(&password)?;
                if unlocked.remove(secret_ref)? {
                    println!("Token removed");
                } else {
                    println!("No such entry");
                }
            }
            VaultCommand::List => {
                let unlocked = vault.unlock(&password)?;
                let names = unlocked.names();
                if names.is_empty() {
                    println!("Vault is empty");
                }
                for name in names {
                    println!("{name}");
                }
            }
        }
        Ok(())
    }
}
