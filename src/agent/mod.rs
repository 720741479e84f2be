//! Agent side: the control channel and per-command tunnels
//!
//! The agent dials out to the broker, authenticates, then turns every tunnel
//! command into a pair of dials: one back to the broker's rendezvous port,
//! one to the requested destination. The two sockets are then spliced.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::protocol::{self, Credentials, TunnelCommand};
use crate::splice;

/// Deadline for each of the agent's two dials
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between dial-back retries while the rendezvous listener is not
/// accepting yet
const DIAL_BACK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Response written onto the broker leg when the destination is unreachable.
/// Forwarded verbatim to the proxy client, so the bytes are fixed.
pub const DESTINATION_UNREACHABLE_RESPONSE: &[u8] =
    b"HTTP/1.1 501 Internal Server Error\r\n\
      Content-Type: text/plain\r\n\
      Content-Length: 14\r\n\
      \r\n\
      Internal Error";

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid broker address: {0:?}")]
    InvalidBrokerAddr(String),

    #[error("timed out dialing {0}")]
    DialTimeout(String),

    #[error("broker closed the control channel during the handshake")]
    HandshakeEof,

    #[error("broker rejected the handshake: {0:?}")]
    HandshakeRejected(String),
}

/// A connected, authenticated agent.
pub struct Agent {
    broker_host: String,
    control: BufReader<TcpStream>,
    tunnel_slots: Arc<Semaphore>,
}

impl Agent {
    /// Dial the broker and perform the credential handshake.
    ///
    /// `broker_addr` is a `host:port` literal; its host part is reused later
    /// for rendezvous dial-backs.
    pub async fn connect(broker_addr: &str, credentials: Credentials) -> Result<Self, AgentError> {
        let (broker_host, _port) = broker_addr
            .rsplit_once(':')
            .ok_or_else(|| AgentError::InvalidBrokerAddr(broker_addr.to_string()))?;

        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(broker_addr))
            .await
            .map_err(|_| AgentError::DialTimeout(broker_addr.to_string()))??;
        stream.set_nodelay(true).ok();

        let mut control = BufReader::new(stream);
        control
            .get_mut()
            .write_all(credentials.encode().as_bytes())
            .await?;

        let mut ack = String::new();
        let n = (&mut control)
            .take(protocol::MAX_LINE_LEN as u64)
            .read_line(&mut ack)
            .await?;
        if n == 0 {
            return Err(AgentError::HandshakeEof);
        }
        if ack.trim() != protocol::ACK {
            return Err(AgentError::HandshakeRejected(ack.trim().to_string()));
        }

        info!(broker = broker_addr, account = %credentials.name, "connected to broker");
        Ok(Self {
            broker_host: broker_host.to_string(),
            control,
            tunnel_slots: Arc::new(Semaphore::new(crate::MAX_TUNNELS)),
        })
    }

    /// Read tunnel commands until the broker closes the control channel.
    ///
    /// Malformed commands are logged and skipped; only EOF or a read error
    /// ends the loop.
    pub async fn run(mut self) -> Result<(), AgentError> {
        loop {
            let mut line = String::new();
            let n = (&mut self.control)
                .take(protocol::MAX_LINE_LEN as u64)
                .read_line(&mut line)
                .await?;
            if n == 0 {
                info!("broker closed the control channel");
                return Ok(());
            }

            let command = match TunnelCommand::parse(&line) {
                Ok(command) => command,
                Err(error) => {
                    warn!(%error, "ignoring malformed tunnel command");
                    continue;
                }
            };
            debug!(
                port = command.rendezvous_port,
                destination = %command.destination,
                "received tunnel command"
            );

            let broker_host = self.broker_host.clone();
            let slots = Arc::clone(&self.tunnel_slots);
            tokio::spawn(async move {
                let _permit = match slots.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                serve_tunnel(&broker_host, command).await;
            });
        }
    }
}

/// Run one tunnel: dial the rendezvous port, dial the destination, splice.
async fn serve_tunnel(broker_host: &str, command: TunnelCommand) {
    let rendezvous_addr = format!("{}:{}", broker_host, command.rendezvous_port);
    let broker_leg = match dial_rendezvous(&rendezvous_addr).await {
        Ok(stream) => stream,
        Err(error) => {
            // No reply path exists; the broker's listener will time out on
            // its own.
            warn!(addr = %rendezvous_addr, %error, "unable to reach rendezvous port");
            return;
        }
    };

    let destination = match timeout(DIAL_TIMEOUT, TcpStream::connect(&command.destination)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            stream
        }
        Ok(Err(error)) => {
            warn!(destination = %command.destination, %error, "unable to reach destination");
            report_destination_failure(broker_leg).await;
            return;
        }
        Err(_) => {
            warn!(destination = %command.destination, "timed out dialing destination");
            report_destination_failure(broker_leg).await;
            return;
        }
    };

    let summary = splice::splice(broker_leg, destination).await;
    if let Some(error) = &summary.error {
        debug!(destination = %command.destination, %error, "tunnel ended with error");
    }
    info!(
        destination = %command.destination,
        broker_to_destination = summary.a_to_b,
        destination_to_broker = summary.b_to_a,
        "tunnel closed"
    );
}

async fn report_destination_failure(mut broker_leg: TcpStream) {
    let _ = broker_leg.write_all(DESTINATION_UNREACHABLE_RESPONSE).await;
    let _ = broker_leg.shutdown().await;
}

/// Dial the rendezvous port, retrying on `ConnectionRefused` until the dial
/// budget elapses.
///
/// The broker binds its listener before it sends the command, so a refusal
/// here is a transient scheduling artifact rather than a missing listener.
async fn dial_rendezvous(addr: &str) -> io::Result<TcpStream> {
    let deadline = Instant::now() + DIAL_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "rendezvous dial budget exhausted",
            ));
        }

        match timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Ok(Err(error)) if error.kind() == io::ErrorKind::ConnectionRefused => {
                sleep(DIAL_BACK_RETRY_INTERVAL.min(remaining)).await;
            }
            Ok(Err(error)) => return Err(error),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "rendezvous dial budget exhausted",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn failure_response_content_length_matches_body() {
        let response = std::str::from_utf8(DESTINATION_UNREACHABLE_RESPONSE).unwrap();
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 501 Internal Server Error"));
        let content_length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(body, "Internal Error");
        assert_eq!(content_length, body.len());
    }

    #[tokio::test]
    async fn dial_rendezvous_waits_for_a_late_listener() {
        // Reserve a port, free it, then bring the listener up after a delay.
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = placeholder.local_addr().unwrap();
        drop(placeholder);

        let listener = tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            listener.accept().await.unwrap();
        });

        let started = Instant::now();
        dial_rendezvous(&addr.to_string()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        listener.await.unwrap();
    }
}
