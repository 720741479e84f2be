//! Control channel wire protocol
//!
//! Line-oriented ASCII framing, `\n`-terminated:
//!
//! - Credential line, agent to broker, first message: `NAME:SECRET`
//! - Acknowledgment, broker to agent: `ok`
//! - Tunnel command, broker to agent: `port PORT connect HOST:PORT`
//!
//! After the handshake the broker only writes on the control channel and the
//! agent only reads.

use thiserror::Error;

/// Acknowledgment sent by the broker on a successful handshake
pub const ACK: &str = "ok";

/// Acknowledgment with line terminator, as written to the wire
pub const ACK_LINE: &str = "ok\n";

/// Upper bound on a single control-channel line
pub const MAX_LINE_LEN: usize = 1024;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed credential line")]
    MalformedCredentials,

    #[error("empty credential field")]
    EmptyCredentialField,

    #[error("credential field contains a reserved character")]
    ReservedCharacter,

    #[error("malformed tunnel command: {0:?}")]
    MalformedCommand(String),

    #[error("invalid rendezvous port: {0:?}")]
    InvalidPort(String),

    #[error("invalid destination: {0:?}")]
    InvalidDestination(String),
}

/// Account credentials exchanged in the control handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub name: String,
    pub secret: String,
}

impl Credentials {
    /// Build credentials, rejecting fields the wire format cannot carry.
    pub fn new(
        name: impl Into<String>,
        secret: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let name = name.into();
        let secret = secret.into();
        if name.is_empty() || secret.is_empty() {
            return Err(ProtocolError::EmptyCredentialField);
        }
        if [&name, &secret]
            .iter()
            .any(|field| field.contains(':') || field.contains('\n') || field.contains('\r'))
        {
            return Err(ProtocolError::ReservedCharacter);
        }
        Ok(Self { name, secret })
    }

    /// Encode as a credential line, including the terminator.
    pub fn encode(&self) -> String {
        format!("{}:{}\n", self.name, self.secret)
    }

    /// Parse a credential line as received from the wire.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (name, secret) = line
            .split_once(':')
            .ok_or(ProtocolError::MalformedCredentials)?;
        if name.is_empty() || secret.is_empty() {
            return Err(ProtocolError::EmptyCredentialField);
        }
        if secret.contains(':') {
            return Err(ProtocolError::ReservedCharacter);
        }
        Ok(Self {
            name: name.to_string(),
            secret: secret.to_string(),
        })
    }
}

/// One tunnel command, sent once over the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    pub rendezvous_port: u16,
    pub destination: String,
}

impl TunnelCommand {
    /// Build a command, validating the destination is a `host:port` literal.
    pub fn new(
        rendezvous_port: u16,
        destination: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let destination = destination.into();
        validate_destination(&destination)?;
        if rendezvous_port == 0 {
            return Err(ProtocolError::InvalidPort("0".to_string()));
        }
        Ok(Self {
            rendezvous_port,
            destination,
        })
    }

    /// Encode as a command line, including the terminator.
    pub fn encode(&self) -> String {
        format!("port {} connect {}\n", self.rendezvous_port, self.destination)
    }

    /// Parse a command line as received from the wire.
    ///
    /// A parse failure must be treated as a warning by the receiver, never as
    /// a reason to terminate the control channel.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() != 4 || words[0] != "port" || words[2] != "connect" {
            return Err(ProtocolError::MalformedCommand(line.trim().to_string()));
        }
        let rendezvous_port: u16 = words[1]
            .parse()
            .map_err(|_| ProtocolError::InvalidPort(words[1].to_string()))?;
        if rendezvous_port == 0 {
            return Err(ProtocolError::InvalidPort(words[1].to_string()));
        }
        validate_destination(words[3])?;
        Ok(Self {
            rendezvous_port,
            destination: words[3].to_string(),
        })
    }
}

/// Check that `destination` is a `host:port` literal the command grammar can
/// carry.
pub fn validate_destination(destination: &str) -> Result<(), ProtocolError> {
    match destination.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(ProtocolError::InvalidDestination(destination.to_string())),
    }
}
