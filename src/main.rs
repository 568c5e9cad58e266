use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backpack_replicator::config::{Config, LoggingConfig};
use backpack_replicator::coordination::{HttpCoordinator, SessionOptions};
use backpack_replicator::error::BackpackErrorTrait;
use backpack_replicator::queue::RedisQueueFactory;
use backpack_replicator::replicator::ReplicatorEvent;
use backpack_replicator::supervisor::{Supervisor, SupervisorEvent};
use backpack_replicator::transfer::HttpTransfer;

const USAGE: &str = "Usage: backpack-replicator <coordination_hosts> </config/root> [concurrency]";

#[derive(Parser)]
#[command(
    name = "backpack-replicator",
    version,
    about = "Replicates content between storage nodes, driven by a coordination service",
    long_about = None
)]
struct Cli {
    /// Comma separated coordination hosts
    hosts: String,

    /// Config root holding /servers-map and /queue
    root: String,

    /// Number of concurrent workers
    concurrency: Option<usize>,

    /// TOML config file (defaults to BACKPACK_* environment variables)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            eprintln!("{USAGE}");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(concurrency) = cli.concurrency {
        config.replicator.concurrency = concurrency;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate()?;

    setup_tracing(&config.logging, cli.verbose)?;

    let hosts = SessionOptions::parse_hosts(&cli.hosts);
    tracing::info!(
        hosts = ?hosts,
        root = %cli.root,
        concurrency = config.replicator.concurrency,
        "backpack-replicator starting"
    );

    let options = SessionOptions::new(hosts, cli.root.as_str())
        .with_timeout(config.coordination.request_timeout());
    let coordinator = HttpCoordinator::new(options, &config.coordination)
        .context("Failed to create coordination client")?;
    let transfer = HttpTransfer::new(&config.transfer).context("Failed to create HTTP client")?;

    let supervisor = Supervisor::new(
        Arc::new(coordinator),
        Arc::new(RedisQueueFactory::new(config.queue.clone())),
        Arc::new(transfer),
        config.replicator.clone(),
    );
    tokio::spawn(report_supervisor_events(supervisor.subscribe()));

    let replicator = tokio::select! {
        replicator = supervisor.get_replicator() => replicator?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted before the replicator was configured");
            supervisor.stop().await;
            return Ok(());
        }
    };

    tokio::spawn(report_replicator_events(replicator.subscribe()));
    replicator.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutdown requested, draining workers");

    let mut events = replicator.subscribe();
    replicator.stop();
    supervisor.stop().await;

    tokio::select! {
        _ = wait_stopped(&mut events) => {}
        _ = tokio::signal::ctrl_c() => tracing::warn!("Forced shutdown"),
    }

    tracing::info!("backpack-replicator stopped");
    Ok(())
}

fn setup_tracing(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("backpack_replicator=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new(format!("backpack_replicator={},warn", logging.level))
    };

    match logging.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn report_supervisor_events(mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::Error(error)) => {
                tracing::debug!(
                    category = ?error.category(),
                    recoverable = error.is_recoverable(),
                    "Supervisor error event"
                );
                eprintln!("{error}");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Supervisor events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn report_replicator_events(mut events: broadcast::Receiver<ReplicatorEvent>) {
    loop {
        match events.recv().await {
            Ok(ReplicatorEvent::Ready) => println!("Replicator is ready!"),
            Ok(ReplicatorEvent::Started) => println!("Replicator started!"),
            Ok(ReplicatorEvent::Stopped) => println!("Replicator stopped"),
            Ok(ReplicatorEvent::Error(error)) => {
                tracing::debug!(
                    category = ?error.category(),
                    recoverable = error.is_recoverable(),
                    "Replicator error event"
                );
                eprintln!("{error}");
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Replicator events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn wait_stopped(events: &mut broadcast::Receiver<ReplicatorEvent>) {
    loop {
        match events.recv().await {
            Ok(ReplicatorEvent::Stopped) | Err(broadcast::error::RecvError::Closed) => return,
            _ => {}
        }
    }
}
