//! The hearth daemon core: composes a data manager with a transport
//! endpoint. Peer sessions route operation lines through a [`Router`] into
//! the manager's stores; termination signals are latched around the
//! shutdown sequence so a mid-shutdown Ctrl-C cannot leave sockets or files
//! half-closed.

mod router;

pub use router::{register_data_operations, Request, Router};

use anyhow::Context;
use async_trait::async_trait;
use common::signal::SignalGate;
use data::DataManager;
use std::sync::Arc;
use std::time::Duration;
use transport::server::{TcpServer, TcpServerConfig, UxdServer, UxdServerConfig};
use transport::{ConnectionPool, Endpoint, Message, Protocol};

/// The transport endpoint a daemon serves on.
pub enum EndpointConfig {
    Uxd(UxdServerConfig),
    Tcp(TcpServerConfig),
}

/// The protocol wiring peer messages into the router.
struct DaemonProtocol {
    manager: Arc<DataManager>,
    router: Arc<Router>,
}

#[async_trait]
impl Protocol for DaemonProtocol {
    async fn handle_message(&self, message: Message) {
        let Some(line) = message.text() else {
            message.respond("error message is not valid utf-8").await;
            return;
        };
        if let Some(reply) = self.router.dispatch(line, &self.manager).await {
            message.respond(&reply).await;
        }
    }
}

enum Server {
    Uxd(UxdServer),
    Tcp(TcpServer),
}

impl Server {
    fn pool(&self) -> &Arc<ConnectionPool> {
        match self {
            Server::Uxd(server) => server.pool(),
            Server::Tcp(server) => server.pool(),
        }
    }

    fn endpoint(&self) -> Endpoint {
        match self {
            Server::Uxd(server) => server.endpoint(),
            Server::Tcp(server) => server.endpoint(),
        }
    }

    async fn close(&self) -> Result<(), transport::Error> {
        match self {
            Server::Uxd(server) => server.close().await,
            Server::Tcp(server) => server.close().await,
        }
    }
}

/// Periodically disconnects peers which have sent nothing for the given
/// period.
fn spawn_idle_reaper(
    pool: Arc<ConnectionPool>,
    endpoint: Endpoint,
    idle: Duration,
) -> tokio::task::JoinHandle<()> {
    let period = (idle / 2).max(Duration::from_millis(250));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            for connection in pool.idle_since(idle) {
                tracing::debug!(?idle, "disconnecting idle peer");
                endpoint
                    .close_connection(&connection, Some("Idle timeout"))
                    .await;
            }
        }
    })
}

/// A long-running daemon process over one endpoint and one data manager.
pub struct Daemon {
    manager: Arc<DataManager>,
    router: Arc<Router>,
    gate: Arc<SignalGate>,
    idle_timeout: Option<Duration>,
}

impl Daemon {
    /// Builds a daemon over a data manager, with the built-in data
    /// operations pre-registered. Further operations register through
    /// [`Daemon::router`].
    pub fn new(manager: Arc<DataManager>) -> Self {
        let router = Router::new();
        register_data_operations(&router);
        Self {
            manager,
            router: Arc::new(router),
            gate: SignalGate::new(),
            idle_timeout: None,
        }
    }

    /// Disconnect peers which stay silent for the given period.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn manager(&self) -> &Arc<DataManager> {
        &self.manager
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn gate(&self) -> &Arc<SignalGate> {
        &self.gate
    }

    /// Serves the endpoint until a termination signal arrives, then tears
    /// everything down: endpoint first, then a final sync and release of the
    /// data stores. The teardown runs inside a blocking context, deferring
    /// any further signal until it completes.
    pub async fn run(&self, endpoint: EndpointConfig) -> anyhow::Result<()> {
        self.gate
            .install()
            .context("cannot subscribe to termination signals")?;

        let protocol: Arc<dyn Protocol> = Arc::new(DaemonProtocol {
            manager: self.manager.clone(),
            router: self.router.clone(),
        });
        let server = match endpoint {
            EndpointConfig::Uxd(config) => Server::Uxd(
                UxdServer::bind(config, Some(protocol))
                    .await
                    .context("cannot open UXD endpoint")?,
            ),
            EndpointConfig::Tcp(config) => Server::Tcp(
                TcpServer::bind(config, Some(protocol))
                    .await
                    .context("cannot open TCP endpoint")?,
            ),
        };
        let reaper = self
            .idle_timeout
            .map(|idle| spawn_idle_reaper(server.pool().clone(), server.endpoint(), idle));
        tracing::info!("daemon serving");

        self.gate.shutdown_token().cancelled().await;
        tracing::info!("daemon shutting down");

        {
            let _blocking = self.gate.enter();
            if let Some(reaper) = reaper {
                reaper.abort();
            }
            if let Err(err) = server.close().await {
                tracing::error!(error = %err, "endpoint did not close cleanly");
            }
            self.manager.sync(None).await;
            self.manager.release().await;
        }
        tracing::info!("daemon stopped");
        Ok(())
    }
}
