//! Backhaul Broker
//!
//! The public-facing half of the reverse CONNECT proxy:
//! - Registers agents over the control channel
//! - Serves HTTP CONNECT to external clients
//! - Brokers a per-request TCP rendezvous between the two

use anyhow::{anyhow, Context, Result};
use backhaul::broker::Broker;
use backhaul::config::{Account, BrokerConfig, Config};
use clap::Parser;
use tracing::{info, warn};

/// Backhaul Broker - reverse HTTP CONNECT proxy
#[derive(Parser, Debug)]
#[command(name = "backhaul-broker")]
#[command(about = "Reverse HTTP CONNECT proxy broker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Port agents connect to (overrides config)
    #[arg(long)]
    client_port: Option<u16>,

    /// Port HTTP CONNECT is served on (overrides config)
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Account in NAME:SECRET form; repeatable, appended to config accounts
    #[arg(short, long = "account", value_name = "NAME:SECRET")]
    accounts: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .context("Failed to load configuration")?
            .broker
            .ok_or_else(|| anyhow!("No [broker] section in config file"))?,
        None => BrokerConfig::default(),
    };

    if let Some(port) = args.client_port {
        config.client_port = port;
    }
    if let Some(port) = args.proxy_port {
        config.proxy_port = port;
    }
    for entry in &args.accounts {
        let (name, secret) = entry
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid account {:?}, expected NAME:SECRET", entry))?;
        config.accounts.push(Account {
            name: name.to_string(),
            secret: secret.to_string(),
        });
    }

    if config.accounts.is_empty() {
        warn!("No accounts configured - broker will reject all agents");
    } else {
        info!("Loaded {} account(s)", config.accounts.len());
    }

    let broker = Broker::bind(&config)
        .await
        .context("Failed to bind listeners")?;

    info!("Backhaul Broker v{}", backhaul::VERSION);
    info!(
        "Control channel on {}, HTTP CONNECT on {}",
        broker.control_addr().context("no control address")?,
        broker.proxy_addr().context("no proxy address")?,
    );

    tokio::select! {
        result = broker.run() => {
            result.context("Broker terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            broker.shutdown().await;
        }
    }

    Ok(())
}
