//! Typed run configuration
//!
//! Configuration is read from a JSON file with an explicit schema; unknown keys
//! are rejected and every value is validated before any network activity.
//!
//! ```json
//! {
//!   "instances": [{"name": "prod", "url": "https://gitlab.example.com"}],
//!   "export_settings": {"max_concurrent_exports": 3, "timeout_minutes": 10}
//! }
//! ```

pub mod env;

use crate::client::ProjectResource;
use crate::Instance;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default number of exports allowed in flight at once
pub const DEFAULT_MAX_CONCURRENT_EXPORTS: usize = 3;

/// Upper bound for `max_concurrent_exports`.
/// GitLab queues exports in Sidekiq; more than this mostly adds server load.
pub const MAX_CONCURRENT_EXPORTS_LIMIT: usize = 32;

/// Default per-job export timeout in minutes
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 10;

/// Default attempt ceiling for one project (trigger→download cycles)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default interval between export status polls
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {message}")]
    Read {
        /// Path of the config file
        path: String,
        /// Underlying IO error
        message: String,
    },

    /// Config file is not valid JSON for the schema
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// No instances configured
    #[error("no GitLab instances configured")]
    NoInstances,

    /// Two instances share a name
    #[error("duplicate instance name: {0}")]
    DuplicateInstance(String),

    /// Invalid instance definition
    #[error("invalid instance '{name}': {reason}")]
    InvalidInstance {
        /// Instance name
        name: String,
        /// Validation failure
        reason: String,
    },

    /// Invalid export setting
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting {
        /// Setting name
        field: &'static str,
        /// Validation failure
        reason: String,
    },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Instance entry as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// Unique instance name
    pub name: String,
    /// Base URL of the GitLab deployment
    pub url: String,
    /// Vault entry holding the token; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

impl InstanceConfig {
    /// Resolve into a runtime [`Instance`]
    pub fn to_instance(&self) -> Instance {
        let secret_ref = self.secret_ref.clone().unwrap_or_else(|| self.name.clone());
        Instance::new(self.name.trim(), self.url.trim(), secret_ref)
    }
}

/// Optional run-level circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBudgetConfig {
    /// Abort when failed / terminal exceeds this ratio
    pub max_failure_ratio: f64,
    /// Minimum terminal jobs before the ratio is evaluated
    pub min_jobs: usize,
}

/// Per-project collections saved next to the archives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SideExportSettings {
    pub issues: bool,
    pub merge_requests: bool,
    pub wikis: bool,
    pub snippets: bool,
}

impl Default for SideExportSettings {
    fn default() -> Self {
        Self {
            issues: true,
            merge_requests: true,
            wikis: true,
            snippets: true,
        }
    }
}

impl SideExportSettings {
    /// Archives only
    pub fn disabled() -> Self {
        Self {
            issues: false,
            merge_requests: false,
            wikis: false,
            snippets: false,
        }
    }

    /// Whether `resource` is exported
    pub fn includes(&self, resource: ProjectResource) -> bool {
        match resource {
            ProjectResource::Issues => self.issues,
            ProjectResource::MergeRequests => self.merge_requests,
            ProjectResource::WikiPages => self.wikis,
            ProjectResource::Snippets => self.snippets,
        }
    }

    /// Whether anything beyond archives is exported
    pub fn any(&self) -> bool {
        ProjectResource::ALL.iter().any(|r| self.includes(*r))
    }
}

/// Export behavior settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportSettings {
    /// Maximum exports in a running state at once
    pub max_concurrent_exports: usize,
    /// Per-attempt polling timeout in minutes
    pub timeout_minutes: u64,
    /// Maximum trigger→download cycles per project
    pub max_attempts: u32,
    /// Give retryable failures one more pass at the end of the run
    pub retry_failed: bool,
    /// Verify TLS certificates
    pub verify_ssl: bool,
    /// Seconds between export status polls
    pub poll_interval_secs: u64,
    /// Include archived projects in enumeration
    pub include_archived: bool,
    /// Issues, merge requests, wikis and snippets exported after the archives
    pub side_exports: SideExportSettings,
    /// Optional error budget; disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_budget: Option<ErrorBudgetConfig>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            max_concurrent_exports: DEFAULT_MAX_CONCURRENT_EXPORTS,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_failed: false,
            verify_ssl: true,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            include_archived: false,
            side_exports: SideExportSettings::default(),
            error_budget: None,
        }
    }
}

impl ExportSettings {
    /// Validate ranges. Called at load time and after CLI overrides.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_exports == 0
            || self.max_concurrent_exports > MAX_CONCURRENT_EXPORTS_LIMIT
        {
            return Err(ConfigError::InvalidSetting {
                field: "max_concurrent_exports",
                reason: format!(
                    "must be between 1 and {MAX_CONCURRENT_EXPORTS_LIMIT}, got {}",
                    self.max_concurrent_exports
                ),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.timeout_minutes == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "timeout_minutes",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(budget) = &self.error_budget {
            if !(budget.max_failure_ratio > 0.0 && budget.max_failure_ratio <= 1.0) {
                return Err(ConfigError::InvalidSetting {
                    field: "error_budget.max_failure_ratio",
                    reason: format!("must be in (0, 1], got {}", budget.max_failure_ratio),
                });
            }
        }
        Ok(())
    }

    /// Per-attempt polling timeout
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    /// Interval between status polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// On-disk configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Instance list
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    /// Export settings
    #[serde(default)]
    pub export_settings: ExportSettings,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Instances to export, in configured order
    pub instances: Vec<Instance>,
    /// Export settings
    pub settings: ExportSettings,
}

impl Config {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let file = Self::read_file(path)?;
        Self::from_file(file)
    }

    /// Read a config file without validating it
    pub fn read_file(path: impl AsRef<Path>) -> ConfigResult<ConfigFile> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse and validate config JSON
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let file: ConfigFile =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_file(file)
    }

    /// Validate a parsed config file
    pub fn from_file(file: ConfigFile) -> ConfigResult<Self> {
        let instances: Vec<Instance> = file.instances.iter().map(|i| i.to_instance()).collect();
        let config = Self {
            instances,
            settings: file.export_settings,
        };
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast validation of instances and settings
    pub fn validate(&self) -> ConfigResult<()> {
        validate_instances(&self.instances)?;
        self.settings.validate()
    }
}

/// Validate instance names and URLs
pub fn validate_instances(instances: &[Instance]) -> ConfigResult<()> {
    if instances.is_empty() {
        return Err(ConfigError::NoInstances);
    }

    let mut seen = HashSet::new();
    for instance in instances {
        if instance.name.is_empty() {
            return Err(ConfigError::InvalidInstance {
                name: instance.base_url.clone(),
                reason: "name must not be empty".to_string(),
            });
        }
        if !seen.insert(instance.name.as_str()) {
            return Err(ConfigError::DuplicateInstance(instance.name.clone()));
        }
        let url = instance.base_url.as_str();
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"));
        match rest {
            Some(host) if !host.is_empty() => {}
            _ => {
                return Err(ConfigError::InvalidInstance {
                    name: instance.name.clone(),
                    reason: format!("url must start with http:// or https://, got '{url}'"),
                })
            }
        }
        if instance.secret_ref.is_empty() {
            return Err(ConfigError::InvalidInstance {
                name: instance.name.clone(),
                reason: "secret_ref must not be empty".to_string(),
            });
        }
    }
    Ok(())
}
