//! Rendezvous port allocation
//!
//! Each tunnel gets a single-use TCP listener on the broker, bound somewhere
//! in a configured port range. The listener exists only for the window
//! between command send and agent dial-back and is closed immediately after
//! the first accept.

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Rendezvous errors
#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("no free rendezvous port in [{lo}, {hi})")]
    NoFreePort { lo: u16, hi: u16 },

    #[error("agent did not dial back within {0:?}")]
    DialBackTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A half-open TCP port range `[lo, hi)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn new(lo: u16, hi: u16) -> Self {
        Self { lo, hi }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            lo: crate::DEFAULT_RENDEZVOUS_LO,
            hi: crate::DEFAULT_RENDEZVOUS_HI,
        }
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.lo, self.hi)
    }
}

/// A single-use rendezvous listener
pub struct RendezvousListener {
    port: u16,
    listener: TcpListener,
}

/// Bind a listener on the first free port in the range, scanning from `lo`.
///
/// A failed bind means the port is taken (possibly by a concurrent session
/// that won the race) and the next port is tried; only exhausting the whole
/// range is an error.
pub async fn allocate(range: PortRange) -> Result<RendezvousListener, RendezvousError> {
    for port in range.lo..range.hi {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                trace!(port, "bound rendezvous listener");
                return Ok(RendezvousListener { port, listener });
            }
            Err(error) => {
                trace!(port, %error, "rendezvous port unavailable");
            }
        }
    }
    Err(RendezvousError::NoFreePort {
        lo: range.lo,
        hi: range.hi,
    })
}

impl RendezvousListener {
    /// The bound port, as advertised to the agent.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the agent's dial-back, consuming the listener.
    ///
    /// The listener closes as soon as this returns, successful or not.
    pub async fn accept_within(self, deadline: Duration) -> Result<TcpStream, RendezvousError> {
        match timeout(deadline, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!(port = self.port, %peer, "rendezvous accepted");
                stream.set_nodelay(true).ok();
                Ok(stream)
            }
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(RendezvousError::DialBackTimeout(deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // A range unlikely to collide with other tests or local services.
    const TEST_RANGE: PortRange = PortRange { lo: 41930, hi: 41940 };

    #[tokio::test]
    async fn allocates_within_range() {
        let rendezvous = allocate(TEST_RANGE).await.unwrap();
        assert!(rendezvous.port() >= TEST_RANGE.lo && rendezvous.port() < TEST_RANGE.hi);
    }

    #[tokio::test]
    async fn skips_occupied_ports() {
        let first = allocate(TEST_RANGE).await.unwrap();
        let second = allocate(TEST_RANGE).await.unwrap();
        assert_ne!(first.port(), second.port());
    }

    #[tokio::test]
    async fn empty_range_is_exhausted() {
        let range = PortRange::new(41950, 41950);
        match allocate(range).await {
            Err(RendezvousError::NoFreePort { lo, hi }) => {
                assert_eq!((lo, hi), (41950, 41950));
            }
            other => panic!("expected NoFreePort, got {:?}", other.map(|l| l.port())),
        }
    }

    #[tokio::test]
    async fn accept_times_out_without_dial_back() {
        let rendezvous = allocate(TEST_RANGE).await.unwrap();
        let deadline = Duration::from_millis(50);
        match rendezvous.accept_within(deadline).await {
            Err(RendezvousError::DialBackTimeout(d)) => assert_eq!(d, deadline),
            other => panic!("expected DialBackTimeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn accept_meets_a_dialer() {
        let rendezvous = allocate(TEST_RANGE).await.unwrap();
        let addr = format!("127.0.0.1:{}", rendezvous.port());

        let dialer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let mut accepted = rendezvous
            .accept_within(Duration::from_secs(5))
            .await
            .unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        dialer.await.unwrap();
    }
}
