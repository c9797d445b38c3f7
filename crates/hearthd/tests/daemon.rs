//! The composed daemon end to end: a UXD endpoint routing data operations
//! into a memory store, shut down through the signal gate.

use async_trait::async_trait;
use common::signal::Signal;
use data::{DataManager, MemoryStore, StoreConfig};
use hearthd::{Daemon, EndpointConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use transport::client::{ClientOptions, UxdClient, UxdClientConfig};
use transport::server::{ServerOptions, UxdServerConfig};
use transport::{Framing, Message, Protocol};

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

#[tokio::test]
async fn test_idle_peers_are_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("idle.sock");

    let manager = Arc::new(DataManager::new(dir.path()));
    manager
        .register_store(Arc::new(MemoryStore::new(StoreConfig::default()).unwrap()))
        .await;

    let daemon = Arc::new(
        Daemon::new(manager).with_idle_timeout(Some(Duration::from_millis(300))),
    );
    let gate = daemon.gate().clone();

    let endpoint = EndpointConfig::Uxd(UxdServerConfig {
        options: ServerOptions {
            framing: Framing::lines(),
            ..ServerOptions::default()
        },
        ..UxdServerConfig::at(&socket)
    });
    let running = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run(endpoint).await })
    };
    let begin = std::time::Instant::now();
    while !socket.exists() {
        assert!(begin.elapsed() < Duration::from_secs(3), "daemon never bound");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let (tx, _rx) = mpsc::unbounded_channel();
    let client = UxdClient::connect(
        UxdClientConfig {
            options: ClientOptions {
                framing: Framing::lines(),
                ..ClientOptions::default()
            },
            ..UxdClientConfig::at(&socket)
        },
        Some(Arc::new(Collect { tx })),
    )
    .await
    .unwrap();
    assert!(client.connected());

    // A silent peer is reaped once the idle timeout elapses.
    let begin = std::time::Instant::now();
    while client.connected() {
        assert!(
            begin.elapsed() < Duration::from_secs(3),
            "idle peer was never disconnected"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    gate.deliver(Signal::Terminate);
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("daemon stops on signal")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_daemon_routes_data_operations() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("hearthd.sock");

    let manager = Arc::new(DataManager::new(dir.path()));
    assert!(
        manager
            .register_store(Arc::new(MemoryStore::new(StoreConfig::default()).unwrap()))
            .await
    );

    let daemon = Arc::new(Daemon::new(manager));
    let gate = daemon.gate().clone();

    let endpoint = EndpointConfig::Uxd(UxdServerConfig {
        options: ServerOptions {
            framing: Framing::lines(),
            ..ServerOptions::default()
        },
        ..UxdServerConfig::at(&socket)
    });
    let running = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run(endpoint).await })
    };

    // Wait for the socket to appear.
    let begin = std::time::Instant::now();
    while !socket.exists() {
        assert!(begin.elapsed() < Duration::from_secs(3), "daemon never bound");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = UxdClient::connect(
        UxdClientConfig {
            options: ClientOptions {
                framing: Framing::lines(),
                ..ClientOptions::default()
            },
            ..UxdClientConfig::at(&socket)
        },
        Some(Arc::new(Collect { tx })),
    )
    .await
    .unwrap();

    let request = |line: &'static str| {
        let client = &client;
        async move {
            assert!(client.send_message(line, true).await);
        }
    };

    request("set Cache run.state \"up\"").await;
    assert_eq!(rx.recv().await.unwrap(), "true\n");

    request("get Cache run.state").await;
    assert_eq!(rx.recv().await.unwrap(), "\"up\"\n");

    request("set Cache run.jobs.[] {\"id\":1}").await;
    assert_eq!(rx.recv().await.unwrap(), "true\n");

    request("get Cache run.jobs.0.id").await;
    assert_eq!(rx.recv().await.unwrap(), "1\n");

    request("nonsense").await;
    assert!(rx
        .recv()
        .await
        .unwrap()
        .starts_with("error unknown operation"));

    client.disconnect().await;

    // A synthetic termination signal winds the daemon down.
    gate.deliver(Signal::Terminate);
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("daemon stops on signal")
        .unwrap();
    assert!(result.is_ok());
    assert!(!socket.exists(), "socket file is removed on shutdown");
}
