//! Notary - Distributed Digital Notary
//!
//! Runs a notary node, the standalone coordination service, or small
//! configuration and status helpers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notary::api::HttpServer;
use notary::config::{CoordinatorConfig, LoggingConfig, NotaryConfig};
use notary::coordination::CoordinationServer;
use notary::error::{Error, Result};
use notary::NotaryNode;

/// Notary - Distributed Digital Notary
#[derive(Parser)]
#[command(name = "notary")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "notary.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a notary node
    Start,

    /// Start the standalone coordination service
    Coordinator {
        /// Address to listen on (overrides the configuration file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "notary.toml")]
        output: PathBuf,

        /// Address other nodes reach this node at
        #[arg(long, default_value = "127.0.0.1:5000")]
        address: String,
    },

    /// Validate configuration file
    Validate,

    /// Query a node's status
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:5000")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Coordinator { bind } => run_coordinator(cli.config, cli.log_level, bind).await,
        Commands::Init { output, address } => run_init(output, address),
        Commands::Validate => run_validate(cli.config),
        Commands::Status { address } => run_status(address).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Start a notary node
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match NotaryConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    init_logging(
        log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    tracing::info!("Starting notary node {}", config.address());

    let node = Arc::new(NotaryNode::from_config(&config)?);
    node.start().await;

    let (stop_tx, stop_rx) = watch::channel(false);
    let server = HttpServer::new(config.api.clone(), config.node.bind_address.clone(), Arc::clone(&node));
    let mut http_task = tokio::spawn(async move { server.start(wait_for_stop(stop_rx)).await });

    let mut http_done = false;
    if config.api.enabled {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
            result = &mut http_task => {
                http_done = true;
                report_http_exit(result);
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received shutdown signal");
    }

    let _ = stop_tx.send(true);
    node.shutdown().await;
    if !http_done {
        report_http_exit(http_task.await);
    }

    tracing::info!("Notary shutdown complete");
    Ok(())
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            break;
        }
    }
}

fn report_http_exit(result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("HTTP API failed: {}", e),
        Err(e) => tracing::error!("HTTP API task failed: {}", e),
    }
}

/// Start the standalone coordination service
async fn run_coordinator(config_path: PathBuf, log_level: Option<String>, bind: Option<String>) -> Result<()> {
    let (mut coordinator, logging) = if config_path.exists() {
        let config = NotaryConfig::from_file(&config_path)?;
        (config.coordinator.clone(), config.logging.clone())
    } else {
        (CoordinatorConfig::default(), LoggingConfig::default())
    };
    init_logging(log_level.as_deref().unwrap_or(&logging.level), &logging.format);

    if let Some(bind) = bind {
        coordinator.bind_address = bind;
    }

    let server = Arc::new(CoordinationServer::new(
        coordinator.bind_address.clone(),
        std::time::Duration::from_millis(coordinator.reap_interval_ms),
    ));
    let task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    server.stop();

    task.await
        .map_err(|e| Error::Internal(format!("coordination server task failed: {}", e)))??;
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, address: String) -> Result<()> {
    let config_content = format!(r#"# Notary Configuration
# Generated configuration file

[node]
bind_address = "0.0.0.0:{port}"
advertise_address = "{address}"

[coordination]
address = "127.0.0.1:2181"
root = "/notary"
session_timeout_ms = 6000
keepalive_interval_ms = 1000
takeover_delay_ms = 500

[ledger]
difficulty = 0
persist_snapshot = false

[replication]
settle_delay_ms = 500
push_timeout_ms = 3000

[reconciliation]
settle_delay_ms = 3000
interval_secs = 5
fetch_timeout_ms = 3000
include_snapshot = false

[coordinator]
bind_address = "0.0.0.0:2181"

[api]
enabled = true
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#,
        port = address.rsplit(':').next().unwrap_or("5000"),
        address = address,
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nStart the coordination service with: notary coordinator --config {}", output.display());
    println!("Then start a node with: notary start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match NotaryConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Address:        {}", config.address());
            println!("  Bind Address:   {}", config.node.bind_address);
            println!("  Coordination:   {}{}", config.coordination.address, config.coordination.root);
            println!("  Difficulty:     {}", config.ledger.difficulty);
            println!("  Reconcile:      every {} s", config.reconciliation.interval_secs);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Query a node's status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}
