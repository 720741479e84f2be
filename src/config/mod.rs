//! Configuration management

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rendezvous::PortRange;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker configuration
    pub broker: Option<BrokerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// One proxy account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub secret: String,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Port agents connect to for the control channel
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    /// Port HTTP CONNECT is served on
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// Low end of the rendezvous port range, inclusive
    #[serde(default = "default_rendezvous_lo")]
    pub rendezvous_lo: u16,
    /// High end of the rendezvous port range, exclusive
    #[serde(default = "default_rendezvous_hi")]
    pub rendezvous_hi: u16,
    /// Maximum simultaneously active tunnels
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: usize,
    /// Deadline for the agent's dial-back, in seconds
    #[serde(default = "default_dial_back_timeout_secs")]
    pub dial_back_timeout_secs: u64,
    /// Proxy accounts
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl BrokerConfig {
    pub fn rendezvous_range(&self) -> PortRange {
        PortRange::new(self.rendezvous_lo, self.rendezvous_hi)
    }

    pub fn dial_back_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_back_timeout_secs)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_port: default_client_port(),
            proxy_port: default_proxy_port(),
            rendezvous_lo: default_rendezvous_lo(),
            rendezvous_hi: default_rendezvous_hi(),
            max_tunnels: default_max_tunnels(),
            dial_back_timeout_secs: default_dial_back_timeout_secs(),
            accounts: Vec::new(),
        }
    }
}

fn default_client_port() -> u16 {
    crate::DEFAULT_CLIENT_PORT
}

fn default_proxy_port() -> u16 {
    crate::DEFAULT_PROXY_PORT
}

fn default_rendezvous_lo() -> u16 {
    crate::DEFAULT_RENDEZVOUS_LO
}

fn default_rendezvous_hi() -> u16 {
    crate::DEFAULT_RENDEZVOUS_HI
}

fn default_max_tunnels() -> usize {
    crate::MAX_TUNNELS
}

fn default_dial_back_timeout_secs() -> u64 {
    crate::DIAL_BACK_TIMEOUT_SECS
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_broker_section_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [broker]
            [[broker.accounts]]
            name = "u"
            secret = "p"
            "#,
        )
        .unwrap();

        let broker = config.broker.unwrap();
        assert_eq!(broker.client_port, crate::DEFAULT_CLIENT_PORT);
        assert_eq!(broker.proxy_port, crate::DEFAULT_PROXY_PORT);
        assert_eq!(broker.rendezvous_range(), PortRange::new(30000, 40000));
        assert_eq!(broker.max_tunnels, crate::MAX_TUNNELS);
        assert_eq!(broker.accounts.len(), 1);
        assert_eq!(broker.accounts[0].name, "u");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            [broker]
            client_port = 9000
            proxy_port = 9090
            rendezvous_lo = 50000
            rendezvous_hi = 50100
            max_tunnels = 8
            dial_back_timeout_secs = 3
            "#,
        )
        .unwrap();

        let broker = config.broker.unwrap();
        assert_eq!(broker.client_port, 9000);
        assert_eq!(broker.proxy_port, 9090);
        assert_eq!(broker.rendezvous_range(), PortRange::new(50000, 50100));
        assert_eq!(broker.max_tunnels, 8);
        assert_eq!(broker.dial_back_timeout(), Duration::from_secs(3));
    }
}
