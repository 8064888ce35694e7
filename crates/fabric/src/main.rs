//! Fabric Manager
//!
//! Loads the requested apps together with their dependency closure, runs
//! them until interrupted, then tears everything down.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use fabric::apps::{self, DemoEvent, link_source};
use fabric::config::ManagerConfig;
use fabric_runtime::{Runtime, split_app_lists};

/// Fabric component manager
#[derive(Parser, Debug)]
#[command(name = "fabric-manager")]
#[command(about = "Fabric component manager", long_about = None)]
struct Args {
    /// Apps to load
    apps: Vec<String>,

    /// Comma-separated app lists, may be repeated
    #[arg(long, value_name = "LIST")]
    app_lists: Vec<String>,

    /// Configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the process id to this file
    #[arg(long, value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Print the component report as JSON once loaded
    #[arg(long)]
    report: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = ManagerConfig::path_or_default(args.config.clone());
    let config = ManagerConfig::load(&config_path)?;

    init_tracing(&config.log_filter, args.json);
    info!("Starting fabric-manager v{}", env!("CARGO_PKG_VERSION"));

    if let Some(path) = &args.pid_file {
        tokio::fs::write(path, std::process::id().to_string())
            .await
            .with_context(|| format!("writing pid file {}", path.display()))?;
    }

    let result = run(&args, config).await;

    if let Some(path) = &args.pid_file {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove pid file {}: {}", path.display(), e);
        }
    }

    result
}

fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();
}

/// Apps named on the command line win over the config file
fn requested_apps(args: &Args, config: &ManagerConfig) -> Vec<String> {
    let cli: Vec<&String> = args.apps.iter().chain(&args.app_lists).collect();
    let mut requested = if cli.is_empty() {
        split_app_lists(&config.apps)
    } else {
        split_app_lists(cli)
    };

    if requested.is_empty() {
        requested.push(apps::DEFAULT_APP.to_string());
    }
    requested
}

async fn run(args: &Args, config: ManagerConfig) -> Result<()> {
    let requested = requested_apps(args, &config);
    info!("Requested apps: {}", requested.join(", "));

    let runtime: Runtime<DemoEvent> = Runtime::new(config.runtime.clone());
    let catalog = apps::catalog();

    let plan = runtime.run_apps(&catalog, &requested).await?;
    if !plan.unresolved.is_empty() {
        warn!("Unresolved apps: {}", plan.unresolved.join(", "));
    }

    info!("Running components:");
    for name in runtime.names() {
        info!("  - {}", name);
    }

    if args.report {
        println!("{}", serde_json::to_string_pretty(&runtime.report())?);
    }

    let poller = runtime
        .contains(link_source::LINK_SOURCE)
        .then(|| link_source::spawn_poller(runtime.clone(), Duration::from_millis(config.tick_ms)));

    shutdown_signal().await;

    if let Some(poller) = poller {
        poller.abort();
    }

    info!("Closing components...");
    runtime.close().await?;
    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
