//! TLS-secured TCP transport: IPv6-only echo with mutual certificates, so
//! the peer certificate is populated on both sides of the session.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use transport::client::{ClientOptions, TcpClient, TcpClientConfig};
use transport::server::{AddressFamily, ServerOptions, TcpServer, TcpServerConfig};
use transport::{tls, Framing, Message, Protocol};

struct Echo;

#[async_trait]
impl Protocol for Echo {
    async fn handle_message(&self, message: Message) {
        if let Some(text) = message.text() {
            message.respond(text.trim_end()).await;
        }
    }
}

struct Collect {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Protocol for Collect {
    async fn handle_message(&self, message: Message) {
        let _ = self
            .tx
            .send(String::from_utf8_lossy(&message.data).into_owned());
    }
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name)
}

#[tokio::test]
async fn test_tls_echo_with_peer_certificates() {
    tls::install_default_provider();
    let cert = fixture("cert.pem");
    let key = fixture("key.pem");

    // The server requires client certificates chaining to the same anchor.
    let server_tls = tls::server_config(&cert, &key, Some(&cert)).unwrap();
    let server = TcpServer::bind(
        TcpServerConfig {
            family: AddressFamily::Ipv6,
            tls: Some(server_tls),
            options: ServerOptions {
                framing: Framing::lines(),
                ..ServerOptions::default()
            },
            ..TcpServerConfig::at("::1", 0)
        },
        Some(Arc::new(Echo)),
    )
    .await
    .expect("server binds [::1]");
    let port = server.local_addrs()[0].port();

    let client_tls = tls::client_config(&cert, Some((&cert, &key))).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = TcpClient::connect(
        TcpClientConfig {
            family: AddressFamily::Ipv6,
            tls: Some((client_tls, "::1".to_string())),
            options: ClientOptions {
                framing: Framing::lines(),
                ..ClientOptions::default()
            },
            ..TcpClientConfig::at("::1", port)
        },
        Some(Arc::new(Collect { tx })),
    )
    .await
    .expect("client connects with the shared trust anchor");

    // A 1-KiB payload makes the round trip intact.
    let payload = "x".repeat(1024);
    assert!(client.send_message(&payload, true).await);
    let echoed = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("echo arrives")
        .unwrap();
    assert_eq!(echoed.trim_end(), payload);

    // Both sides carry the peer's certificate.
    let client_side = client.connection().unwrap();
    assert!(client_side.peer().tls);
    assert!(client_side.peer().peer_cert.is_some());

    let begin = std::time::Instant::now();
    loop {
        let sessions = server.pool().connections();
        if let Some(server_side) = sessions.first() {
            assert!(server_side.peer().tls);
            assert!(server_side.peer().peer_cert.is_some());
            assert!(server_side.peer().peer_address.is_some());
            break;
        }
        if begin.elapsed() > Duration::from_secs(2) {
            panic!("server session never appeared in the pool");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    client.disconnect().await;
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_tls_client_rejects_unknown_anchor() {
    tls::install_default_provider();
    let cert = fixture("cert.pem");
    let key = fixture("key.pem");

    let server_tls = tls::server_config(&cert, &key, None).unwrap();
    let server = TcpServer::bind(
        TcpServerConfig {
            family: AddressFamily::Ipv6,
            tls: Some(server_tls),
            ..TcpServerConfig::at("::1", 0)
        },
        Some(Arc::new(Echo)),
    )
    .await
    .unwrap();
    let port = server.local_addrs()[0].port();

    // An empty root store trusts nothing; the handshake must fail.
    let empty = tempfile::NamedTempFile::new().unwrap();
    let client_tls = tls::client_config(empty.path(), None).unwrap();
    let result = TcpClient::connect(
        TcpClientConfig {
            family: AddressFamily::Ipv6,
            tls: Some((client_tls, "::1".to_string())),
            ..TcpClientConfig::at("::1", port)
        },
        None,
    )
    .await;
    assert!(result.is_err());

    server.close().await.unwrap();
}
