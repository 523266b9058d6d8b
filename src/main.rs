//! Main entry point for the gitlab-backup CLI

use clap::Parser;
use gitlab_backup::cli::{Cli, CliError, Commands};
use gitlab_backup::shutdown::ShutdownCoordinator;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gitlab_backup=info"));

    // Logs go to stderr so stdout stays clean for reports
    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let shutdown = ShutdownCoordinator::shared();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received - finishing in-flight writes...");
                shutdown.request_shutdown();
            }
        }
    });

    match cli.command {
        Commands::Export(ref args) => args.execute(&cli, shutdown).await,
        Commands::Vault(ref command) => command.execute(&cli).map(|()| 0),
        Commands::Validate(ref args) => args.execute(&cli).await.map(|()| 0),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let code = e.exit_code();
            error!("Command failed: {}", e);
            eprintln!("Error: {}", anyhow::Error::from(e));
            std::process::exit(code);
        }
    }
}
