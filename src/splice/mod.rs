//! Bidirectional stream splicing
//!
//! Both endpoints of a tunnel run the same primitive: copy bytes in both
//! directions between two TCP streams until each direction sees EOF or an
//! error on its source. The two directions terminate independently and the
//! splice resolves only when both have finished.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

/// Copy buffer size per direction
const COPY_BUF_SIZE: usize = 16 * 1024;

/// Outcome of one splice: per-direction byte counts and the first error seen.
///
/// A one-sided error is not a failure of the splice; the peer closing from
/// its side often surfaces as an error on ours.
#[derive(Debug, Default)]
pub struct SpliceSummary {
    /// Bytes copied from `a` to `b`, including any preface
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`
    pub b_to_a: u64,
    /// First error observed in either direction, if any
    pub error: Option<io::Error>,
}

/// Splice two streams until both directions have terminated.
pub async fn splice(a: TcpStream, b: TcpStream) -> SpliceSummary {
    splice_with_preface(a, &[], b).await
}

/// Splice two streams, first writing `preface` onto `b`.
///
/// The preface carries bytes that were already read off `a`'s socket before
/// the splice began, such as data a client pipelined behind an HTTP header
/// section.
pub async fn splice_with_preface(a: TcpStream, preface: &[u8], b: TcpStream) -> SpliceSummary {
    let (a_read, a_write) = a.into_split();
    let (b_read, mut b_write) = b.into_split();

    if !preface.is_empty() {
        trace!(bytes = preface.len(), "writing splice preface");
        if let Err(error) = b_write.write_all(preface).await {
            return SpliceSummary {
                error: Some(error),
                ..SpliceSummary::default()
            };
        }
    }

    let ((forward, forward_err), (backward, backward_err)) = tokio::join!(
        copy_half(a_read, b_write),
        copy_half(b_read, a_write),
    );

    SpliceSummary {
        a_to_b: forward + preface.len() as u64,
        b_to_a: backward,
        error: forward_err.or(backward_err),
    }
}

/// Copy one direction to completion, then half-close the write side so
/// termination propagates to the peer without waiting for its next read.
async fn copy_half(
    mut read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
) -> (u64, Option<io::Error>) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut copied = 0u64;
    let error = loop {
        match read.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => match write.write_all(&buf[..n]).await {
                Ok(()) => copied += n as u64,
                Err(e) => break Some(e),
            },
            Err(e) => break Some(e),
        }
    };
    let _ = write.shutdown().await;
    (copied, error)
}
