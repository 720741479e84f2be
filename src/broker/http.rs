//! Minimal HTTP/1.1 request-head handling for the proxy port
//!
//! Only enough HTTP to serve CONNECT: the request line, a lowercased header
//! map, Basic proxy credentials, and a handful of canned responses. Anything
//! beyond the header section stays buffered for the tunnel to forward.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::BrokerError;

/// Upper bound on the request line plus headers
const MAX_HEADER_SECTION: usize = 8192;

/// A parsed HTTP/1.1 request head
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: HashMap<String, String>,
}

/// Read the request line and headers, leaving any pipelined bytes in the
/// reader's buffer.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
) -> Result<RequestHead, BrokerError>
where
    S: AsyncRead + Unpin,
{
    let mut limited = (&mut *reader).take(MAX_HEADER_SECTION as u64);

    let mut request_line = String::new();
    if limited.read_line(&mut request_line).await? == 0 {
        return Err(BrokerError::MalformedRequest);
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(BrokerError::MalformedRequest)?.to_string();
    let target = parts.next().ok_or(BrokerError::MalformedRequest)?.to_string();
    let _version = parts.next().ok_or(BrokerError::MalformedRequest)?;

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if limited.read_line(&mut line).await? == 0 {
            return Err(if limited.limit() == 0 {
                BrokerError::HeaderSectionTooLarge
            } else {
                BrokerError::MalformedRequest
            });
        }

        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok(RequestHead {
        method,
        target,
        headers,
    })
}

/// Decode `Proxy-Authorization: Basic <base64(user:pass)>`, if present and
/// well-formed.
pub(crate) fn basic_credentials(head: &RequestHead) -> Option<(String, String)> {
    let value = head.headers.get("proxy-authorization")?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

pub(crate) async fn respond_ok<S: AsyncWrite + Unpin>(stream: &mut S) -> std::io::Result<()> {
    stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await
}

pub(crate) async fn respond_auth_required<S: AsyncWrite + Unpin>(
    stream: &mut S,
) -> std::io::Result<()> {
    write_response(
        stream,
        "407 Proxy Authentication Required",
        &[("Proxy-Authenticate", "Basic realm=\"Restricted\"")],
        "proxy authentication required\n",
    )
    .await
}

pub(crate) async fn respond_method_not_allowed<S: AsyncWrite + Unpin>(
    stream: &mut S,
) -> std::io::Result<()> {
    write_response(stream, "405 Method Not Allowed", &[], "method not allowed\n").await
}

pub(crate) async fn respond_bad_gateway<S: AsyncWrite + Unpin>(
    stream: &mut S,
) -> std::io::Result<()> {
    write_response(stream, "502 Bad Gateway", &[], "no rendezvous port available\n").await
}

pub(crate) async fn respond_not_found<S: AsyncWrite + Unpin>(
    stream: &mut S,
    reason: &str,
) -> std::io::Result<()> {
    write_response(stream, "404 Not Found", &[], reason).await
}

async fn write_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status: &str,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> std::io::Result<()> {
    let mut response = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in extra_headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str(&format!(
        "Content-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    ));
    stream.write_all(response.as_bytes()).await
}
