//! # Backhaul
//!
//! A reverse HTTP CONNECT proxy for reaching TCP destinations that are only
//! reachable from behind NAT or a firewall.
//!
//! Two cooperating processes form the system:
//!
//! - A **broker** that accepts HTTP CONNECT requests from external clients,
//!   authenticates them against a registry of connected agents, and brokers a
//!   per-request TCP rendezvous between the client and the right agent.
//! - An **agent** that dials out to the broker, holds a long-lived control
//!   channel, and per tunnel command dials both the broker's rendezvous port
//!   and the requested destination, then splices the two.
//!
//! ## Architecture
//!
//! ```text
//! external client          broker                      agent (behind NAT)
//!      |  CONNECT host:port   |                             |
//!      |--------------------->|  port P connect host:port   |
//!      |                      |---------------------------->|
//!      |                      |<-- dial broker:P -----------|--> dial host:port
//!      |<----- 200 OK --------|                             |
//!      |<==== splice ========>|<========== splice =========>|
//! ```
//!
//! Four TCP legs, two splice pairs, one logical tunnel.

pub mod agent;
pub mod broker;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod rendezvous;
pub mod splice;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port agents connect to for the control channel
pub const DEFAULT_CLIENT_PORT: u16 = 7000;

/// Default port HTTP CONNECT is served on
pub const DEFAULT_PROXY_PORT: u16 = 7070;

/// Default rendezvous port range, half-open
pub const DEFAULT_RENDEZVOUS_LO: u16 = 30000;
pub const DEFAULT_RENDEZVOUS_HI: u16 = 40000;

/// Default cap on simultaneously active tunnels at one endpoint
pub const MAX_TUNNELS: usize = 100;

/// Default deadline in seconds for the agent's dial-back to the rendezvous port
pub const DIAL_BACK_TIMEOUT_SECS: u64 = 10;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Rendezvous error: {0}")]
    Rendezvous(#[from] rendezvous::RendezvousError),

    #[error("Broker error: {0}")]
    Broker(#[from] broker::BrokerError),

    #[error("Agent error: {0}")]
    Agent(#[from] agent::AgentError),

    #[error("Configuration error: {0}")]
    Config(String),
}
