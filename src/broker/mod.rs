//! Broker side: agent registration and the HTTP CONNECT service
//!
//! Two accept loops run here. The control listener registers agents after a
//! credential handshake; the proxy listener serves CONNECT requests by
//! brokering a rendezvous with the right agent.

mod http;
mod tunnel;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::protocol::{self, Credentials};
use crate::registry::{AccountTable, AgentHandle, AgentRegistry};
use crate::rendezvous::{PortRange, RendezvousError};

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed HTTP request")]
    MalformedRequest,

    #[error("request head too large")]
    HeaderSectionTooLarge,

    #[error("proxy authentication failed")]
    AuthFailed,

    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("control channel write failed: {0}")]
    ControlWriteFailed(#[source] std::io::Error),
}

/// Process-wide broker state, shared by every handler task.
pub(crate) struct BrokerContext {
    pub(crate) accounts: AccountTable,
    pub(crate) registry: AgentRegistry,
    pub(crate) rendezvous_range: PortRange,
    pub(crate) tunnel_slots: Semaphore,
    pub(crate) dial_back_timeout: Duration,
}

/// The broker: both listeners plus the shared context.
pub struct Broker {
    ctx: Arc<BrokerContext>,
    control_listener: TcpListener,
    proxy_listener: TcpListener,
}

impl Broker {
    /// Bind both listeners per the configuration.
    pub async fn bind(config: &BrokerConfig) -> std::io::Result<Self> {
        let accounts: AccountTable = config
            .accounts
            .iter()
            .map(|account| (account.name.clone(), account.secret.clone()))
            .collect();

        let control_listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.client_port)).await?;
        let proxy_listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.proxy_port)).await?;

        Ok(Self {
            ctx: Arc::new(BrokerContext {
                accounts,
                registry: AgentRegistry::new(),
                rendezvous_range: config.rendezvous_range(),
                tunnel_slots: Semaphore::new(config.max_tunnels),
                dial_back_timeout: config.dial_back_timeout(),
            }),
            control_listener,
            proxy_listener,
        })
    }

    /// Address of the control-channel listener.
    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control_listener.local_addr()
    }

    /// Address of the HTTP CONNECT listener.
    pub fn proxy_addr(&self) -> std::io::Result<SocketAddr> {
        self.proxy_listener.local_addr()
    }

    /// Number of currently registered agents.
    pub fn online_agents(&self) -> usize {
        self.ctx.registry.len()
    }

    /// Run both accept loops until the process is shut down.
    pub async fn run(&self) -> std::io::Result<()> {
        loop {
            tokio::select! {
                accepted = self.control_listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "new control connection");
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(handle_control(ctx, stream, peer));
                        }
                        Err(e) => error!("control accept error: {}", e),
                    }
                }
                accepted = self.proxy_listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "new proxy connection");
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(handle_proxy(ctx, stream, peer));
                        }
                        Err(e) => error!("proxy accept error: {}", e),
                    }
                }
            }
        }
    }

    /// Close every registered control channel; agents observe EOF and exit
    /// their read loops. In-flight tunnels fail on their next I/O.
    pub async fn shutdown(&self) {
        info!("draining agent registry");
        self.ctx.registry.drain().await;
    }
}

/// Handshake a control connection and watch it until it closes.
async fn handle_control(ctx: Arc<BrokerContext>, stream: TcpStream, peer: SocketAddr) {
    stream.set_nodelay(true).ok();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    match (&mut reader)
        .take(protocol::MAX_LINE_LEN as u64)
        .read_line(&mut line)
        .await
    {
        Ok(0) => {
            debug!(%peer, "control connection closed before handshake");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            debug!(%peer, "control handshake read error: {}", e);
            return;
        }
    }

    let credentials = match Credentials::parse(&line) {
        Ok(credentials) => credentials,
        Err(error) => {
            warn!(%peer, %error, "rejecting malformed control handshake");
            return;
        }
    };
    if !ctx.accounts.verify(&credentials.name, &credentials.secret) {
        // Dropped without an ack; the agent treats the EOF as a failed
        // handshake.
        warn!(%peer, account = %credentials.name, "control handshake with bad credentials");
        return;
    }

    if let Err(e) = write_half.write_all(protocol::ACK_LINE.as_bytes()).await {
        warn!(%peer, account = %credentials.name, "failed to ack handshake: {}", e);
        return;
    }

    let handle = AgentHandle::new(credentials.name.as_str(), write_half);
    let id = handle.id();
    if let Some(displaced) = ctx.registry.register(handle) {
        info!(account = %credentials.name, "replacing existing control connection");
        displaced.close().await;
    }
    info!(account = %credentials.name, %peer, "agent connected");

    // EOF watcher. The agent never writes after the handshake, so this read
    // resolves only when the connection dies; the entry is removed before the
    // next CONNECT can pick a dead channel.
    let mut discard = [0u8; 512];
    loop {
        match reader.read(&mut discard).await {
            Ok(0) => break,
            Ok(n) => {
                warn!(account = %credentials.name, bytes = n, "unexpected data on control channel")
            }
            Err(e) => {
                debug!(account = %credentials.name, "control channel read error: {}", e);
                break;
            }
        }
    }

    if ctx.registry.unregister(&credentials.name, id) {
        info!(account = %credentials.name, "agent disconnected");
    }
}

/// Parse one HTTP request head and dispatch it.
async fn handle_proxy(ctx: Arc<BrokerContext>, stream: TcpStream, peer: SocketAddr) {
    stream.set_nodelay(true).ok();
    let mut reader = BufReader::new(stream);

    let head = match http::read_request_head(&mut reader).await {
        Ok(head) => head,
        Err(error) => {
            debug!(%peer, %error, "failed to read request head");
            return;
        }
    };

    if head.method != "CONNECT" {
        debug!(%peer, method = %head.method, "rejecting non-CONNECT request");
        if let Err(e) = http::respond_method_not_allowed(reader.get_mut()).await {
            debug!(%peer, "failed to write 405: {}", e);
        }
        return;
    }

    if let Err(error) = tunnel::serve_connect(ctx, reader, head).await {
        debug!(%peer, %error, "tunnel not established");
    }
}
