//! Export command

use super::secrets::load_inputs;
use super::{Cli, CliError, OutputFormat};
use crate::config::SideExportSettings;
use crate::export::RecordObserver;
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::report::{Outcome, ReportRecord, RunReport};
use crate::shutdown::SharedShutdown;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Export command arguments
#[derive(Parser, Debug, Default)]
pub struct ExportArgs {
    /// Only export these instances (repeatable)
    #[arg(long)]
    pub instance: Vec<String>,

    /// Override `timeout_minutes`
    #[arg(long)]
    pub timeout_minutes: Option<u64>,

    /// Override `max_attempts`
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_attempts: Option<u32>,

    /// Give retryable failures one more pass at the end of each instance
    #[arg(long, default_value_t = false)]
    pub retry_failed: bool,

    /// Include archived projects
    #[arg(long, default_value_t = false)]
    pub include_archived: bool,

    /// Export archives only, without issues, merge requests, wikis or snippets
    #[arg(long, default_value_t = false)]
    pub skip_side_exports: bool,

    /// Skip TLS certificate verification
    #[arg(long, default_value_t = false)]
    pub insecure: bool,

    /// Do not draw a progress spinner
    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
}

impl ExportArgs {
    /// Run the export; returns the process exit code
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<i32, CliError> {
        let mut inputs = load_inputs(cli, &mut std::io::stdin().lock(), true)?;
        inputs.select(&self.instance)?;

        let settings = &mut inputs.settings;
        if let Some(minutes) = self.timeout_minutes {
            settings.timeout_minutes = minutes;
        }
        if let Some(attempts) = self.max_attempts {
            settings.max_attempts = attempts;
        }
        settings.retry_failed |= self.retry_failed;
        settings.include_archived |= self.include_archived;
        if self.insecure {
            settings.verify_ssl = false;
        }
        if self.skip_side_exports {
            settings.side_exports = SideExportSettings::disabled();
        }
        settings.validate()?;

        if let Some(addr) = cli.metrics_addr {
            metrics::init_metrics(addr).await?;
        }

        let Some(credentials) = inputs.credentials.take() else {
            return Err(CliError::InvalidArgument("no credentials available".to_string()));
        };

        info!(
            instances = inputs.instances.len(),
            max_concurrent = inputs.settings.max_concurrent_exports,
            output_dir = %cli.output_dir.display(),
            "Starting export"
        );

        let progress = (!self.no_progress && cli.output_format == OutputFormat::Human)
            .then(create_progress_bar);
        let mut orchestrator =
            Orchestrator::new(inputs.settings.clone(), cli.output_dir.clone(), shutdown);
        if let Some(pb) = &progress {
            orchestrator = orchestrator.with_record_observer(progress_observer(pb.clone()));
        }

        let result = orchestrator.run(&inputs.instances, &credentials).await;
        if let Some(pb) = &progress {
            pb.finish_and_clear();
        }
        let report = result?;

        output_report(&report, cli.output_format);
        Ok(report.exit_code())
    }
}

fn output_report(report: &RunReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(report) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Failed to encode report: {e}"),
        },
        OutputFormat::Human => print!("{}", report.render()),
    }
}

/// Spinner counting terminal jobs
fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) =
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message("Enumerating projects");
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn progress_observer(pb: ProgressBar) -> RecordObserver {
    let completed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);
    Arc::new(move |record: &ReportRecord| {
        let counter = match record.outcome {
            Outcome::Completed => &completed,
            Outcome::Failed => &failed,
            Outcome::Skipped => &skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        pb.set_message(format!(
            "{} completed, {} skipped, {} failed - last: {}",
            completed.load(Ordering::Relaxed),
            skipped.load(Ordering::Relaxed),
            failed.load(Ordering::Relaxed),
            record.project.path
        ));
    })
}
