//! Integration tests for Backhaul
//!
//! Tests the full broker-agent flow over real sockets:
//! - CONNECT authentication and status codes
//! - End-to-end byte fidelity through the rendezvous
//! - Control-channel registration, replacement, and shutdown
//! - Tunnel concurrency limiting

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use backhaul::agent::{Agent, DESTINATION_UNREACHABLE_RESPONSE};
use backhaul::broker::Broker;
use backhaul::config::{Account, BrokerConfig};
use backhaul::protocol::Credentials;

const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

fn test_config(accounts: &[(&str, &str)]) -> BrokerConfig {
    BrokerConfig {
        client_port: 0,
        proxy_port: 0,
        accounts: accounts
            .iter()
            .map(|(name, secret)| Account {
                name: name.to_string(),
                secret: secret.to_string(),
            })
            .collect(),
        ..BrokerConfig::default()
    }
}

/// Bind a broker on ephemeral ports and run its accept loops.
async fn start_broker(config: BrokerConfig) -> (Arc<Broker>, String, String) {
    let broker = Arc::new(Broker::bind(&config).await.unwrap());
    let control_addr = format!("127.0.0.1:{}", broker.control_addr().unwrap().port());
    let proxy_addr = format!("127.0.0.1:{}", broker.proxy_addr().unwrap().port());

    let runner = Arc::clone(&broker);
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    (broker, control_addr, proxy_addr)
}

/// Connect an agent and run its command loop in the background.
async fn start_agent(control_addr: &str, name: &str, secret: &str) {
    let credentials = Credentials::new(name, secret).unwrap();
    let agent = Agent::connect(control_addr, credentials).await.unwrap();
    tokio::spawn(async move {
        let _ = agent.run().await;
    });
}

/// A TCP echo server that serves every accepted connection until EOF.
async fn start_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Issue a CONNECT request; returns the client stream with the response
/// still unread.
async fn send_connect(proxy_addr: &str, target: &str, auth: Option<&str>) -> TcpStream {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(credentials) = auth {
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

async fn expect_ok(stream: &mut TcpStream) {
    let mut head = vec![0u8; OK_RESPONSE.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut head))
        .await
        .expect("timed out waiting for CONNECT response")
        .unwrap();
    assert_eq!(head, OK_RESPONSE);
}

async fn read_all(mut stream: TcpStream) -> Vec<u8> {
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("timed out reading response")
        .unwrap();
    response
}

/// Register a raw control channel, asserting on the handshake outcome.
async fn raw_control_client(control_addr: &str, line: &str, expect_ack: bool) -> TcpStream {
    let mut stream = TcpStream::connect(control_addr).await.unwrap();
    stream.write_all(line.as_bytes()).await.unwrap();

    if expect_ack {
        let mut ack = [0u8; 3];
        timeout(Duration::from_secs(5), stream.read_exact(&mut ack))
            .await
            .expect("timed out waiting for handshake ack")
            .unwrap();
        assert_eq!(&ack, b"ok\n");
    }
    stream
}

#[tokio::test]
async fn happy_path_round_trips_bytes() {
    let (_broker, control_addr, proxy_addr) = start_broker(test_config(&[("u", "p")])).await;
    start_agent(&control_addr, "u", "p").await;
    let echo_addr = start_echo_server().await;

    let mut client = send_connect(&proxy_addr, &echo_addr, Some("u:p")).await;
    expect_ok(&mut client).await;

    for payload in [&b"hello through the tunnel"[..], &b"and back again"[..]] {
        client.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .expect("timed out waiting for echo")
            .unwrap();
        assert_eq!(echoed, payload);
    }
}

#[tokio::test]
async fn unknown_account_is_rejected() {
    let (_broker, control_addr, proxy_addr) = start_broker(test_config(&[("u", "p")])).await;
    start_agent(&control_addr, "u", "p").await;

    let client = send_connect(&proxy_addr, "example.com:80", Some("nope:nope")).await;
    let response = String::from_utf8(read_all(client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
    assert!(response.contains("Proxy-Authenticate: Basic realm=\"Restricted\"\r\n"));
}

#[tokio::test]
async fn missing_authorization_is_rejected() {
    let (_broker, control_addr, proxy_addr) = start_broker(test_config(&[("u", "p")])).await;
    start_agent(&control_addr, "u", "p").await;

    let client = send_connect(&proxy_addr, "example.com:80", None).await;
    let response = String::from_utf8(read_all(client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
}

#[tokio::test]
async fn offline_agent_is_rejected() {
    // Account exists but no agent is connected for it.
    let (_broker, _control_addr, proxy_addr) = start_broker(test_config(&[("u", "p")])).await;

    let client = send_connect(&proxy_addr, "example.com:80", Some("u:p")).await;
    let response = String::from_utf8(read_all(client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
}

#[tokio::test]
async fn non_connect_method_is_rejected() {
    let (_broker, _control_addr, proxy_addr) = start_broker(test_config(&[("u", "p")])).await;

    let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_all(client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
}

#[tokio::test]
async fn unreachable_destination_returns_fixed_501() {
    let (_broker, control_addr, proxy_addr) = start_broker(test_config(&[("u", "p")])).await;
    start_agent(&control_addr, "u", "p").await;

    // Reserve a port and free it again so the dial is refused.
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = placeholder.local_addr().unwrap().to_string();
    drop(placeholder);

    let client = send_connect(&proxy_addr, &dead_addr, Some("u:p")).await;
    let response = read_all(client).await;

    let mut expected = OK_RESPONSE.to_vec();
    expected.extend_from_slice(DESTINATION_UNREACHABLE_RESPONSE);
    assert_eq!(response, expected);
}

#[tokio::test]
async fn pipelined_client_bytes_reach_the_destination() {
    let (_broker, control_addr, proxy_addr) = start_broker(test_config(&[("u", "p")])).await;
    start_agent(&control_addr, "u", "p").await;
    let echo_addr = start_echo_server().await;

    // Payload sent in the same write as the header section, before the
    // CONNECT response comes back.
    let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nProxy-Authorization: Basic {}\r\n\r\nearly payload",
        echo_addr,
        BASE64.encode("u:p")
    );
    client.write_all(request.as_bytes()).await.unwrap();

    expect_ok(&mut client).await;
    let mut echoed = vec![0u8; b"early payload".len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("timed out waiting for pipelined echo")
        .unwrap();
    assert_eq!(echoed, b"early payload");
}

#[tokio::test]
async fn re_registration_replaces_the_control_channel() {
    let (broker, control_addr, proxy_addr) = start_broker(test_config(&[("u", "p")])).await;

    let mut first = raw_control_client(&control_addr, "u:p\n", true).await;
    let second = raw_control_client(&control_addr, "u:p\n", true).await;

    // The displaced connection is closed by the broker.
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), first.read(&mut buf))
        .await
        .expect("timed out waiting for displaced connection to close")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(broker.online_agents(), 1);

    // Commands for the account now reach only the second connection.
    let _client = send_connect(&proxy_addr, "127.0.0.1:9", Some("u:p")).await;
    let mut reader = BufReader::new(second);
    let mut command = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut command))
        .await
        .expect("timed out waiting for tunnel command")
        .unwrap();
    assert!(command.starts_with("port "));
    assert!(command.trim_end().ends_with("connect 127.0.0.1:9"));
}

#[tokio::test]
async fn handshake_with_bad_credentials_gets_no_ack() {
    let (broker, control_addr, _proxy_addr) = start_broker(test_config(&[("u", "p")])).await;

    for line in ["u:wrong\n", "ghost:p\n", "garbage\n"] {
        let mut rejected = raw_control_client(&control_addr, line, false).await;
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(5), rejected.read(&mut buf))
            .await
            .expect("timed out waiting for rejection")
            .unwrap();
        assert_eq!(n, 0, "line {:?} should be dropped without an ack", line);
    }
    assert_eq!(broker.online_agents(), 0);
}

#[tokio::test]
async fn shutdown_closes_all_control_channels() {
    let (broker, control_addr, _proxy_addr) =
        start_broker(test_config(&[("a", "x"), ("b", "y")])).await;

    let mut first = raw_control_client(&control_addr, "a:x\n", true).await;
    let mut second = raw_control_client(&control_addr, "b:y\n", true).await;
    assert_eq!(broker.online_agents(), 2);

    broker.shutdown().await;
    assert_eq!(broker.online_agents(), 0);

    for stream in [&mut first, &mut second] {
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("timed out waiting for EOF after shutdown")
            .unwrap();
        assert_eq!(n, 0);
    }
}

#[tokio::test]
async fn dead_agent_leg_closes_client_and_frees_slot() {
    let mut config = test_config(&[("u", "p")]);
    config.max_tunnels = 1;
    let (_broker, control_addr, proxy_addr) = start_broker(config).await;

    // Drive the agent side by hand so the rendezvous socket can be killed
    // mid-splice.
    let agent_control = raw_control_client(&control_addr, "u:p\n", true).await;
    let mut agent_control = BufReader::new(agent_control);

    let mut client = send_connect(&proxy_addr, "192.0.2.1:80", Some("u:p")).await;

    let mut command = String::new();
    timeout(Duration::from_secs(5), agent_control.read_line(&mut command))
        .await
        .expect("timed out waiting for tunnel command")
        .unwrap();
    let port: u16 = command.split_whitespace().nth(1).unwrap().parse().unwrap();
    let mut agent_leg = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    expect_ok(&mut client).await;
    client.write_all(b"abc").await.unwrap();
    let mut buf = [0u8; 3];
    timeout(Duration::from_secs(5), agent_leg.read_exact(&mut buf))
        .await
        .expect("timed out waiting for client bytes")
        .unwrap();
    assert_eq!(&buf, b"abc");

    // Kill the agent leg mid-splice; the client must observe EOF.
    drop(agent_leg);
    let mut one = [0u8; 1];
    let n = timeout(Duration::from_secs(5), client.read(&mut one))
        .await
        .expect("timed out waiting for tunnel teardown")
        .unwrap();
    assert_eq!(n, 0);
    drop(client);

    // The slot is free again: a fresh tunnel on the only permit succeeds.
    let mut next = send_connect(&proxy_addr, "192.0.2.1:80", Some("u:p")).await;
    let mut command = String::new();
    timeout(Duration::from_secs(5), agent_control.read_line(&mut command))
        .await
        .expect("timed out waiting for second command")
        .unwrap();
    let port: u16 = command.split_whitespace().nth(1).unwrap().parse().unwrap();
    let _agent_leg = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    expect_ok(&mut next).await;
}

#[tokio::test]
async fn tunnel_limit_queues_excess_sessions() {
    let mut config = test_config(&[("u", "p")]);
    config.max_tunnels = 1;
    let (_broker, control_addr, proxy_addr) = start_broker(config).await;
    start_agent(&control_addr, "u", "p").await;
    let echo_addr = start_echo_server().await;

    // First tunnel holds the only slot.
    let mut busy = send_connect(&proxy_addr, &echo_addr, Some("u:p")).await;
    expect_ok(&mut busy).await;
    busy.write_all(b"x").await.unwrap();
    let mut one = [0u8; 1];
    busy.read_exact(&mut one).await.unwrap();

    // The second session must queue at the limiter before its 200 OK.
    let mut queued = send_connect(&proxy_addr, &echo_addr, Some("u:p")).await;
    let mut head = vec![0u8; OK_RESPONSE.len()];
    let premature = timeout(Duration::from_millis(500), queued.read_exact(&mut head)).await;
    assert!(premature.is_err(), "second tunnel got a slot while the first held it");

    // Releasing the first slot unblocks it.
    drop(busy);
    expect_ok(&mut queued).await;
    queued.write_all(b"y").await.unwrap();
    queued.read_exact(&mut one).await.unwrap();
    assert_eq!(&one, b"y");
}
