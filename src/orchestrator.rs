//! Run orchestration across instances
//!
//! Order of a run:
//!
//! 1. Resolve every instance's token and build its client
//! 2. Lock and load the resume ledger
//! 3. Validate every token against the instance (a rejected token stops the run)
//! 4. Per instance, one after another: enumerate projects, write
//!    `project_list.json`, schedule the exports, save issues, merge requests,
//!    wikis and snippets, write `export_report.json`
//! 5. Close the ledger and write the run report
//!
//! An error inside one instance (for example an unwritable run directory)
//! aborts that instance only; its report carries the error and the run goes
//! on with the next instance.
//!
//! Instances run sequentially so `max_concurrent_exports` bounds the whole run.

use crate::client::{
    collect_projects, ApiError, ApiResult, ExportApi, GitLabClient, HttpOptions, RemoteProject,
};
use crate::config::ExportSettings;
use crate::export::{
    ErrorBudget, JobRunner, RecordObserver, RetryPolicy, RunStatus, RunnerConfig, Scheduler,
    SideExporter,
};
use crate::output::{ledger_path, run_report_path, write_json_atomic, OutputError, RunLayout};
use crate::report::{InstanceReport, ReportAggregator, ReportError, RunReport};
use crate::resume::{LedgerError, LedgerHandle, ResumeLedger};
use crate::shutdown::{CancelReason, SharedShutdown};
use crate::vault::{UnlockedVault, VaultError};
use crate::{Instance, ProjectKey, ProjectRef};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Exit code for errors that stop a run before any export starts
pub const EXIT_FATAL: i32 = 2;

/// Orchestration errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Vault could not provide a credential
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// No credential for an instance
    #[error("no credential available for instance '{instance}'")]
    MissingCredential {
        /// Instance name
        instance: String,
    },

    /// Token rejected during validation
    #[error("authentication failed for instance '{instance}': {message}")]
    Auth {
        /// Instance name
        instance: String,
        /// Server response
        message: String,
    },

    /// Client could not be constructed
    #[error("client setup failed for instance '{instance}': {source}")]
    Client {
        /// Instance name
        instance: String,
        /// Cause
        source: ApiError,
    },

    /// Ledger error
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Output error
    #[error("output error: {0}")]
    Output(#[from] OutputError),

    /// Report error
    #[error("report error: {0}")]
    Report(#[from] ReportError),
}

impl OrchestratorError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Vault(_)
            | OrchestratorError::MissingCredential { .. }
            | OrchestratorError::Auth { .. }
            | OrchestratorError::Client { .. }
            | OrchestratorError::Ledger(_) => EXIT_FATAL,
            OrchestratorError::Output(_) | OrchestratorError::Report(_) => 1,
        }
    }
}

/// Where instance tokens come from
pub enum CredentialSource {
    /// Unlocked credential vault, looked up by `secret_ref`
    Vault(UnlockedVault),
    /// Tokens from the environment, keyed by instance name
    Env(HashMap<String, SecretString>),
}

impl CredentialSource {
    /// Token for `instance`
    pub fn token_for(&self, instance: &Instance) -> Result<SecretString, OrchestratorError> {
        let missing = || OrchestratorError::MissingCredential {
            instance: instance.name.clone(),
        };
        match self {
            CredentialSource::Vault(vault) => match vault.fetch(&instance.secret_ref) {
                Ok(token) => Ok(token),
                Err(VaultError::NotFound) => Err(missing()),
                Err(e) => Err(e.into()),
            },
            CredentialSource::Env(tokens) => tokens
                .get(&instance.name)
                .map(|t| SecretString::from(t.expose_secret().to_string()))
                .ok_or_else(missing),
        }
    }
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::Vault(vault) => f.debug_tuple("Vault").field(vault).finish(),
            CredentialSource::Env(tokens) => f
                .debug_struct("Env")
                .field("instances", &tokens.len())
                .finish_non_exhaustive(),
        }
    }
}

/// Builds the API client for one instance
pub type ClientFactory = Arc<
    dyn Fn(&Instance, &SecretString, &ExportSettings) -> ApiResult<Arc<dyn ExportApi>> + Send + Sync,
>;

/// Factory producing [`GitLabClient`]s
pub fn gitlab_client_factory() -> ClientFactory {
    Arc::new(|instance, token, settings| {
        let options = HttpOptions {
            verify_ssl: settings.verify_ssl,
            ..HttpOptions::default()
        };
        let client = GitLabClient::new(instance, token, options)?;
        Ok(Arc::new(client) as Arc<dyn ExportApi>)
    })
}

/// Contents of `project_list.json`
#[derive(Debug, Serialize)]
struct ProjectList<'a> {
    instance: &'a str,
    base_url: &'a str,
    enumerated_at: DateTime<Utc>,
    count: usize,
    projects: &'a [RemoteProject],
}

struct PreparedInstance {
    instance: Instance,
    client: Arc<dyn ExportApi>,
}

/// Runs a backup of several instances into one output root
pub struct Orchestrator {
    settings: ExportSettings,
    output_root: PathBuf,
    shutdown: SharedShutdown,
    factory: ClientFactory,
    observer: Option<RecordObserver>,
}

impl Orchestrator {
    /// Orchestrator using the HTTP client
    pub fn new(settings: ExportSettings, output_root: impl Into<PathBuf>, shutdown: SharedShutdown) -> Self {
        Self {
            settings,
            output_root: output_root.into(),
            shutdown,
            factory: gitlab_client_factory(),
            observer: None,
        }
    }

    /// Replace the client factory
    pub fn with_client_factory(mut self, factory: ClientFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Observe every terminal job record (progress display)
    pub fn with_record_observer(mut self, observer: RecordObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Back up `instances`.
    ///
    /// # Errors
    /// Credential, ledger and authentication problems abort the run before any
    /// export starts. Job failures are not errors; they are in the report.
    pub async fn run(
        &self,
        instances: &[Instance],
        credentials: &CredentialSource,
    ) -> Result<RunReport, OrchestratorError> {
        let started_at = Utc::now();

        let mut prepared = Vec::with_capacity(instances.len());
        for instance in instances {
            let token = credentials.token_for(instance)?;
            let client = (self.factory)(instance, &token, &self.settings).map_err(|source| {
                OrchestratorError::Client {
                    instance: instance.name.clone(),
                    source,
                }
            })?;
            prepared.push(PreparedInstance {
                instance: instance.clone(),
                client,
            });
        }

        let ledger = ResumeLedger::open(ledger_path(&self.output_root))?;
        let completed = Arc::new(ledger.completed().clone());
        info!(
            completed = completed.len(),
            path = %ledger.path().display(),
            "Resume ledger loaded"
        );

        let mut reports = Vec::new();
        let mut ready = Vec::new();
        for item in prepared {
            match self.validate(&item).await {
                Ok(()) => ready.push(item),
                Err(ValidationFailure::Fatal(e)) => return Err(e),
                Err(ValidationFailure::Skip(status)) => {
                    reports.push(InstanceReport::not_run(
                        &item.instance.name,
                        PathBuf::new(),
                        Utc::now(),
                        status,
                    ));
                }
            }
        }

        let writer = ledger.into_writer().await?;
        let budget = self.settings.error_budget.map(ErrorBudget::new);

        for item in ready {
            if self.shutdown.is_cancelled() || budget.as_ref().is_some_and(|b| b.is_exceeded()) {
                let status = if self.shutdown.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::BudgetExceeded
                };
                info!(instance = %item.instance.name, %status, "Instance not started");
                reports.push(InstanceReport::not_run(
                    &item.instance.name,
                    PathBuf::new(),
                    Utc::now(),
                    status,
                ));
                continue;
            }
            let report = self
                .run_instance(item, writer.handle(), Arc::clone(&completed), budget.clone())
                .await;
            reports.push(report);
        }

        writer.close().await?;

        let report = RunReport::from_instances(started_at, reports);
        report.write(&run_report_path(&self.output_root, started_at))?;
        info!(
            completed = report.totals.completed,
            failed = report.totals.failed,
            skipped = report.totals.skipped,
            not_started = report.totals.not_started,
            "Run finished"
        );
        Ok(report)
    }

    async fn validate(&self, item: &PreparedInstance) -> Result<(), ValidationFailure> {
        let name = &item.instance.name;
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                return Err(ValidationFailure::Skip(RunStatus::Cancelled));
            }
            result = item.client.validate() => result,
        };
        match result {
            Ok(info) => {
                info!(
                    instance = %name,
                    username = %info.username,
                    version = info.version.as_deref().unwrap_or("unknown"),
                    "Token validated"
                );
                Ok(())
            }
            Err(ApiError::Auth(message)) => {
                error!(instance = %name, "Token rejected");
                Err(ValidationFailure::Fatal(OrchestratorError::Auth {
                    instance: name.clone(),
                    message,
                }))
            }
            Err(e) => {
                error!(instance = %name, error = %e, "Instance unreachable, skipping it");
                Err(ValidationFailure::Skip(RunStatus::InstanceAborted))
            }
        }
    }

    /// Run one instance. Errors outside any single job (an unwritable run
    /// directory, a failed report write) stop this instance only.
    async fn run_instance(
        &self,
        item: PreparedInstance,
        ledger: LedgerHandle,
        completed: Arc<HashSet<ProjectKey>>,
        budget: Option<Arc<ErrorBudget>>,
    ) -> InstanceReport {
        let name = item.instance.name.clone();
        let started_at = Utc::now();
        let layout = Arc::new(RunLayout::new(self.output_root.clone(), &name, started_at));

        match self
            .export_instance(item, Arc::clone(&layout), started_at, ledger, completed, budget)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                error!(instance = %name, error = %e, "Instance aborted");
                let report = InstanceReport::aborted(
                    &name,
                    layout.run_dir().to_path_buf(),
                    started_at,
                    &e,
                );
                if let Err(write_err) = report.write(&layout.report_path()) {
                    warn!(instance = %name, error = %write_err, "Could not write instance report");
                }
                report
            }
        }
    }

    async fn export_instance(
        &self,
        item: PreparedInstance,
        layout: Arc<RunLayout>,
        started_at: DateTime<Utc>,
        ledger: LedgerHandle,
        completed: Arc<HashSet<ProjectKey>>,
        budget: Option<Arc<ErrorBudget>>,
    ) -> Result<InstanceReport, OrchestratorError> {
        let PreparedInstance { instance, client } = item;
        layout.ensure_directories()?;
        let scope = self.shutdown.child();

        info!(instance = %instance.name, run_dir = %layout.run_dir().display(), "Enumerating projects");
        let retry = RetryPolicy::from_settings(&self.settings);
        let listing = collect_projects(
            Arc::clone(&client),
            self.settings.include_archived,
            retry,
            Arc::clone(&scope),
        )
        .await;
        let projects = match listing {
            Ok(projects) => projects,
            Err(e) => {
                let status = match e {
                    ApiError::Cancelled => match scope.reason() {
                        Some(CancelReason::ErrorBudget) => RunStatus::BudgetExceeded,
                        Some(CancelReason::InstanceAborted) => RunStatus::InstanceAborted,
                        _ => RunStatus::Cancelled,
                    },
                    e => {
                        error!(instance = %instance.name, error = %e, "Project enumeration failed");
                        RunStatus::InstanceAborted
                    }
                };
                let report = InstanceReport::not_run(
                    &instance.name,
                    layout.run_dir().to_path_buf(),
                    started_at,
                    status,
                );
                report.write(&layout.report_path())?;
                return Ok(report);
            }
        };

        write_json_atomic(
            &layout.project_list_path(),
            &ProjectList {
                instance: &instance.name,
                base_url: &instance.base_url,
                enumerated_at: Utc::now(),
                count: projects.len(),
                projects: &projects,
            },
        )?;
        info!(instance = %instance.name, count = projects.len(), "Projects enumerated");

        let refs: Vec<ProjectRef> = projects.iter().map(|p| p.to_ref(&instance.name)).collect();

        let aggregator = ReportAggregator::spawn(
            &instance.name,
            layout.run_dir().to_path_buf(),
            layout.error_log_path(),
            started_at,
        );
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&client),
            Arc::clone(&layout),
            completed,
            ledger,
            aggregator.sender(),
            Arc::clone(&scope),
            RunnerConfig::from_settings(&self.settings),
        ));
        let scheduler = Scheduler::new(runner)
            .with_error_budget(budget)
            .with_observer(self.observer.clone());
        let max_concurrent = self.settings.max_concurrent_exports;

        let mut outcome = scheduler.run(refs, max_concurrent).await;

        if self.settings.retry_failed && outcome.status == RunStatus::Finished {
            let retry_refs: Vec<ProjectRef> = outcome
                .records
                .iter()
                .filter(|r| r.is_retryable_failure())
                .map(|r| r.project.clone())
                .collect();
            if !retry_refs.is_empty() {
                info!(instance = %instance.name, count = retry_refs.len(), "Retrying failed projects");
                let second = scheduler.run(retry_refs, max_concurrent).await;
                outcome.status = second.status;
            }
        }
        drop(scheduler);

        if outcome.status == RunStatus::Finished {
            let side = SideExporter::new(
                client,
                Arc::clone(&layout),
                self.settings.side_exports,
                retry,
                Arc::clone(&scope),
                aggregator.sender(),
            );
            side.run(&projects, max_concurrent).await;
        } else {
            warn!(instance = %instance.name, status = %outcome.status, "Instance stopped early");
        }

        let report = aggregator
            .finish(outcome.status, outcome.total, layout.report_path())
            .await?;
        Ok(report)
    }
}

enum ValidationFailure {
    Fatal(OrchestratorError),
    Skip(RunStatus),
}
