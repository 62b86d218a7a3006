//! # Scanfleet Server
//!
//! Coordinator process for the scan fleet. It connects to the shared Redis broker, recovers units
//! whose workers went silent and fires recurring jobs. Workers and the HTTP tier talk to the same
//! broker through `scanfleet-core`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use scanfleet_core::{
    Coordinator, partition,
    store::{RedisKeys, RedisStore},
    worker::WorkerRegistry,
};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use scanfleet_server::config::{
    Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions, loader::render_coordinator,
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "scanfleet-server")]
#[command(about = "Coordinator for a distributed security scan fleet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the recovery sweeper and cron scheduler until interrupted (default)
    Run,
    /// Show how a target list would be split into units, without touching the broker
    Preview {
        /// File holding the target list, one target per line
        #[arg(long)]
        targets: PathBuf,
        /// Scan configuration JSON used for the duration estimate
        #[arg(long)]
        scan_config: Option<String>,
    },
    /// List registered workers with derived liveness
    Workers,
    /// Load and validate the configuration, print the effective settings and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scanfleet_core=info".into()),
        )
        .with(fmt::layer())
        .init();

    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config.clone(),
        env_file: cli.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Preview {
            targets,
            scan_config,
        } => preview(&config, &targets, scan_config.as_deref()),
        Command::Workers => list_workers(config).await,
        Command::CheckConfig => check_config(&config),
    }
}

async fn connect(config: &Config) -> anyhow::Result<RedisStore> {
    let keys = RedisKeys::new(config.coordinator.queue.environment.clone());
    let store = RedisStore::connect(
        &config.redis.url,
        keys,
        config.coordinator.queue.claim_scan_batch,
    )
    .await
    .context("failed to connect to Redis")?;
    store.ping().await.context("Redis did not answer PING")?;
    Ok(store)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = connect(&config).await?;
    let coordinator = Coordinator::new(Arc::new(store), config.coordinator)
        .context("invalid coordinator configuration")?;
    coordinator
        .start()
        .await
        .context("failed to start coordinator loops")?;

    shutdown_signal().await;
    coordinator.shutdown().await;
    Ok(())
}

fn preview(config: &Config, targets: &Path, scan_config: Option<&str>) -> anyhow::Result<()> {
    let spec = std::fs::read_to_string(targets)
        .with_context(|| format!("failed to read target list {}", targets.display()))?;
    let scan_config: Value = match scan_config {
        Some(raw) => serde_json::from_str(raw).context("scan config is not valid JSON")?,
        None => Value::Null,
    };

    let preview = partition::preview(&spec, &config.coordinator.partition, &scan_config)
        .context("failed to compute partition preview")?;
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(())
}

async fn list_workers(config: Config) -> anyhow::Result<()> {
    let store = connect(&config).await?;
    let registry = WorkerRegistry::new(Arc::new(store), config.coordinator.liveness);
    let workers = registry
        .list_workers()
        .await
        .context("failed to list workers")?;
    println!("{}", serde_json::to_string_pretty(&workers)?);
    Ok(())
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    match &config.metadata.config_path {
        Some(path) => info!(path = %path.display(), "configuration file loaded"),
        None => info!("no configuration file; defaults and environment only"),
    }
    info!(
        env_file_loaded = config.metadata.env_file_loaded,
        "environment overrides applied"
    );
    println!(
        "{}",
        render_coordinator(&config.coordinator).context("failed to render configuration")?
    );
    info!("configuration OK");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn preview_help_describes_line_separated_targets() {
        let mut cli = Cli::command();
        let preview = cli
            .find_subcommand_mut("preview")
            .expect("preview subcommand");
        let help = preview.render_long_help().to_string();
        assert!(help.contains("one target per line"));
        assert!(!help.contains("comma"));
    }

    #[test]
    fn preview_parses_a_targets_file() {
        let cli = Cli::try_parse_from(["scanfleet-server", "preview", "--targets", "hosts.txt"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Some(Command::Preview { ref targets, .. }) if targets == Path::new("hosts.txt")
        ));
    }
}
