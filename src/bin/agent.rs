//! Backhaul Agent
//!
//! The NAT-side half of the reverse CONNECT proxy:
//! - Dials out to the broker and holds the control channel
//! - Per tunnel command, dials the rendezvous port and the destination
//! - Splices the two sockets for the life of the tunnel

use anyhow::{Context, Result};
use backhaul::agent::Agent;
use backhaul::protocol::Credentials;
use clap::Parser;
use tracing::info;

/// Backhaul Agent - reverse HTTP CONNECT proxy agent
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(about = "Reverse HTTP CONNECT proxy agent")]
#[command(version)]
struct Args {
    /// Broker control-channel address (HOST:PORT)
    broker: String,

    /// Account name
    username: String,

    /// Account secret
    password: String,

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

    let credentials = Credentials::new(args.username.as_str(), args.password.as_str())
        .context("Invalid credentials")?;

    info!("Backhaul Agent v{}", backhaul::VERSION);

    let agent = Agent::connect(&args.broker, credentials)
        .await
        .context("Failed to connect to broker")?;

    agent.run().await.context("Control channel failed")?;

    Ok(())
}
