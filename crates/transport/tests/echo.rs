//! End-to-end UXD transport scenarios: a persistent line-framed echo
//! session, capacity rejection, and graceful shutdown liveness.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use transport::client::{ClientOptions, UxdClient, UxdClientConfig};
use transport::server::{ServerOptions, UxdServer, UxdServerConfig};
use transport::{Connection, Framing, Message, Protocol};

/// Replies every line back to its sender; a "Quit" line closes the session.
struct Echo;

#[async_trait]
impl Protocol for Echo {
    async fn handle_message(&self, message: Message) {
        let Some(text) = message.text() else { return };
        let line = text.trim_end();
        if line == "Quit" {
            message
                .endpoint()
                .close_connection(&message.sender, None)
                .await;
        } else {
            message.respond(line).await;
        }
    }
}

/// Client-side protocol collecting every received message.
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

fn line_server_options(max_connections: Option<usize>) -> ServerOptions {
    ServerOptions {
        framing: Framing::lines(),
        max_connections,
        ..ServerOptions::default()
    }
}

fn line_client_options() -> ClientOptions {
    ClientOptions {
        framing: Framing::lines(),
        ..ClientOptions::default()
    }
}

async fn eventually(what: &str, deadline: Duration, mut check: impl FnMut() -> bool) {
    let begin = std::time::Instant::now();
    while !check() {
        if begin.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn connect_collecting(
    path: &std::path::Path,
) -> (UxdClient, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = UxdClient::connect(
        UxdClientConfig {
            options: line_client_options(),
            ..UxdClientConfig::at(path)
        },
        Some(Arc::new(Collect { tx })),
    )
    .await
    .expect("client connects");
    (client, rx)
}

#[tokio::test]
async fn test_persistent_line_framed_echo() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("s1.sock");

    let server = UxdServer::bind(
        UxdServerConfig {
            options: line_server_options(None),
            ..UxdServerConfig::at(&socket)
        },
        Some(Arc::new(Echo)),
    )
    .await
    .expect("server binds");

    let (client, mut rx) = connect_collecting(&socket).await;
    assert!(client.connected());

    assert!(client.send_message("Ping", true).await);
    let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("echo arrives")
        .unwrap();
    assert_eq!(reply, "Ping\n");

    // The server observed our credentials over SO_PEERCRED.
    let sessions: Vec<Arc<Connection>> = server.pool().connections();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].peer().pid, Some(std::process::id() as i32));
    assert!(sessions[0].peer().uid.is_some());

    // "Quit" ends the session with an EOF towards us.
    assert!(client.send_message("Quit", true).await);
    eventually("client EOF", Duration::from_secs(3), || !client.connected()).await;
    eventually("empty server pool", Duration::from_secs(3), || {
        server.pool().is_empty()
    })
    .await;

    server.close().await.expect("server closes");
}

#[tokio::test]
async fn test_capacity_reject_with_reason() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("s3.sock");

    let server = UxdServer::bind(
        UxdServerConfig {
            options: line_server_options(Some(2)),
            ..UxdServerConfig::at(&socket)
        },
        Some(Arc::new(Echo)),
    )
    .await
    .unwrap();

    let (first, _rx1) = connect_collecting(&socket).await;
    let (second, _rx2) = connect_collecting(&socket).await;
    eventually("two pooled sessions", Duration::from_secs(2), || {
        server.pool().len() == 2
    })
    .await;

    // The third connection is told why, then sees EOF.
    let (third, mut rx3) = connect_collecting(&socket).await;
    let reason = tokio::time::timeout(Duration::from_secs(2), rx3.recv())
        .await
        .expect("rejection reason arrives")
        .unwrap();
    assert_eq!(reason, "Too many connections\n");
    eventually("third client EOF", Duration::from_secs(2), || {
        !third.connected()
    })
    .await;
    assert_eq!(server.pool().len(), 2);

    first.disconnect().await;
    second.disconnect().await;
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_liveness() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("down.sock");

    let server = UxdServer::bind(
        UxdServerConfig {
            options: line_server_options(None),
            ..UxdServerConfig::at(&socket)
        },
        Some(Arc::new(Echo)),
    )
    .await
    .unwrap();

    let (client, _rx) = connect_collecting(&socket).await;
    eventually("pooled session", Duration::from_secs(2), || {
        server.pool().len() == 1
    })
    .await;
    let sessions = server.pool().connections();

    server.close().await.unwrap();

    // Every connection is stamped closed and the endpoint refuses new ones.
    for connection in &sessions {
        assert!(connection.closed_at().is_some());
        assert_eq!(connection.outstanding_readers(), 0);
        assert_eq!(connection.outstanding_writers(), 0);
    }
    assert!(server.pool().is_empty());
    assert!(
        UxdClient::connect(UxdClientConfig::at(&socket), None)
            .await
            .is_err(),
        "closed endpoint accepts no new connections"
    );

    eventually("client observes EOF", Duration::from_secs(3), || {
        !client.connected()
    })
    .await;
}
