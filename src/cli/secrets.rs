//! Instance and credential resolution shared by the commands

use super::{Cli, CliError};
use crate::config::env::{env_mode_enabled, instances_from_env, process_env};
use crate::config::{validate_instances, Config, ExportSettings};
use crate::orchestrator::CredentialSource;
use crate::vault::{CredentialVault, UnlockedVault};
use crate::Instance;
use secrecy::SecretString;
use std::collections::HashMap;
use std::io::BufRead;
use tracing::info;
use zeroize::Zeroizing;

/// Environment variable holding the vault password
pub const VAULT_PASSWORD_ENV: &str = "GITLAB_BACKUP_VAULT_PASSWORD";

/// Read one line, without its terminator, as a secret
pub fn read_secret_line<R: BufRead>(reader: &mut R, what: &str) -> Result<SecretString, CliError> {
    let mut line = Zeroizing::new(String::new());
    let read = reader
        .read_line(&mut line)
        .map_err(|e| CliError::InputError(format!("failed to read {what}: {e}")))?;
    let value = line.trim_end_matches(['\r', '\n']);
    if read == 0 || value.is_empty() {
        return Err(CliError::InputError(format!("no {what} on stdin")));
    }
    Ok(SecretString::from(value.to_string()))
}

/// Vault password from stdin (`--password-stdin`) or the environment
pub fn vault_password<R, F>(
    password_stdin: bool,
    stdin: &mut R,
    lookup: F,
) -> Result<SecretString, CliError>
where
    R: BufRead,
    F: Fn(&str) -> Option<String>,
{
    if password_stdin {
        return read_secret_line(stdin, "vault password");
    }
    match lookup(VAULT_PASSWORD_ENV) {
        Some(password) if !password.is_empty() => Ok(SecretString::from(password)),
        _ => Err(CliError::InvalidArgument(format!(
            "no vault password: set {VAULT_PASSWORD_ENV} or pass --password-stdin"
        ))),
    }
}

/// Unlock the vault named by `--vault`
pub fn unlock_vault<R: BufRead>(cli: &Cli, stdin: &mut R) -> Result<UnlockedVault, CliError> {
    let password = vault_password(cli.password_stdin, stdin, process_env)?;
    Ok(CredentialVault::new(&cli.vault).unlock(&password)?)
}

/// Instances, settings and credentials for a run
#[derive(Debug)]
pub struct RunInputs {
    /// Instances in configured order
    pub instances: Vec<Instance>,
    /// Settings after CLI overrides
    pub settings: ExportSettings,
    /// Token source; `None` when credentials were not requested
    pub credentials: Option<CredentialSource>,
}

impl RunInputs {
    /// Keep only the named instances, in configured order
    pub fn select(&mut self, names: &[String]) -> Result<(), CliError> {
        if names.is_empty() {
            return Ok(());
        }
        if let Some(unknown) = names
            .iter()
            .find(|name| !self.instances.iter().any(|i| &i.name == *name))
        {
            return Err(CliError::InvalidArgument(format!(
                "unknown instance '{unknown}'"
            )));
        }
        self.instances.retain(|i| names.contains(&i.name));
        Ok(())
    }
}

/// Resolve instances and settings, and unlock credentials when `with_credentials`.
///
/// With `GITLAB_USE_ENV_VARS=true` instances and tokens come from the
/// environment and the config file, if present, only contributes settings.
pub fn load_inputs<R: BufRead>(
    cli: &Cli,
    stdin: &mut R,
    with_credentials: bool,
) -> Result<RunInputs, CliError> {
    let mut inputs = if env_mode_enabled(process_env) {
        let settings = if cli.config.exists() {
            Config::read_file(&cli.config)?.export_settings
        } else {
            ExportSettings::default()
        };
        let env_instances = instances_from_env(process_env);
        info!(instances = env_instances.len(), "Using instances from environment");
        let mut tokens = HashMap::new();
        let mut instances = Vec::with_capacity(env_instances.len());
        for entry in env_instances {
            tokens.insert(entry.instance.name.clone(), entry.token);
            instances.push(entry.instance);
        }
        validate_instances(&instances)?;
        RunInputs {
            instances,
            settings,
            credentials: with_credentials.then(|| CredentialSource::Env(tokens)),
        }
    } else {
        let config = Config::load(&cli.config)?;
        let credentials = if with_credentials {
            Some(CredentialSource::Vault(unlock_vault(cli, stdin)?))
        } else {
            None
        };
        RunInputs {
            instances: config.instances,
            settings: config.settings,
            credentials,
        }
    };

    if let Some(max) = cli.max_concurrent {
        inputs.settings.max_concurrent_exports = max;
    }
    inputs.settings.validate()?;
    Ok(inputs)
}
