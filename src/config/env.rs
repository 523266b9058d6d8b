//! Environment-variable instance mode
//!
//! When `GITLAB_USE_ENV_VARS=true`, instances and their tokens are read from
//! `GITLAB_INSTANCE_<i>_{NAME,URL,TOKEN}` for `i = 0..`, stopping at the first
//! index where any of the three is missing.

use crate::Instance;
use secrecy::SecretString;

/// Switch selecting environment-variable mode
pub const USE_ENV_VARS: &str = "GITLAB_USE_ENV_VARS";

/// Prefix for numbered instance variables
pub const INSTANCE_PREFIX: &str = "GITLAB_INSTANCE_";

/// An instance together with the token read from the environment
pub struct EnvInstance {
    /// Resolved instance; `secret_ref` equals the name
    pub instance: Instance,
    /// Access token
    pub token: SecretString,
}

impl std::fmt::Debug for EnvInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvInstance")
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

/// Whether environment-variable mode is selected
pub fn env_mode_enabled<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(USE_ENV_VARS)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Read numbered instances using `lookup` (usually `std::env::var(..).ok()`)
pub fn instances_from_env<F>(lookup: F) -> Vec<EnvInstance>
where
    F: Fn(&str) -> Option<String>,
{
    let mut instances = Vec::new();
    for i in 0.. {
        let var = |field: &str| {
            lookup(&format!("{INSTANCE_PREFIX}{i}_{field}")).filter(|v| !v.trim().is_empty())
        };
        let (Some(name), Some(url), Some(token)) = (var("NAME"), var("URL"), var("TOKEN")) else {
            break;
        };
        let name = name.trim().to_string();
        instances.push(EnvInstance {
            instance: Instance::new(name.clone(), url.trim(), name),
            token: SecretString::from(token.trim().to_string()),
        });
    }
    instances
}

/// Process-environment lookup
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
