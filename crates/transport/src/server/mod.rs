mod tcp;
mod uxd;

pub use tcp::{AddressFamily, TcpServer, TcpServerConfig};
pub use uxd::{UxdServer, UxdServerConfig};

use crate::connection::{BoxedReader, Connection, ConnectionMode};
use crate::endpoint::Shared;
use crate::framing::Framing;
use crate::message::Endpoint;
use crate::pool::ConnectionPool;
use crate::protocol::{DefaultProtocol, Protocol};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Options shared by every server flavor.
#[derive(Clone)]
pub struct ServerOptions {
    /// Symmetric per-endpoint message size limit.
    pub limit: Option<usize>,
    pub framing: Framing,
    pub mode: ConnectionMode,
    pub max_connections: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            limit: None,
            framing: Framing::default(),
            mode: ConnectionMode::Persistent,
            max_connections: None,
        }
    }
}

/// Core shared by the UXD and TCP servers: the endpoint state, the
/// connection pool, and the acceptor task registry.
pub(crate) struct ServerInner {
    pub shared: Arc<Shared>,
    pub pool: Arc<ConnectionPool>,
    acceptors: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerInner {
    pub fn new(
        name: &str,
        options: &ServerOptions,
        protocol: Option<Arc<dyn Protocol>>,
    ) -> Arc<Self> {
        let protocol = protocol.unwrap_or_else(|| Arc::new(DefaultProtocol));
        Arc::new(Self {
            shared: Shared::new(name, options.limit, options.framing, protocol),
            pool: ConnectionPool::new(options.max_connections),
            acceptors: Mutex::new(Vec::new()),
        })
    }

    pub fn track_acceptor(&self, handle: JoinHandle<()>) {
        self.acceptors.lock().unwrap().push(handle);
    }

    /// Admits a new connection into the pool and runs its session, or
    /// rejects it when the pool is full.
    pub fn launch(self: &Arc<Self>, connection: Arc<Connection>, reader: BoxedReader) {
        let inner = self.clone();
        let conn = connection.clone();
        let admitted = self
            .pool
            .spawn_session(connection.clone(), async move {
                inner.session(conn, reader).await;
            });
        if !admitted {
            let inner = self.clone();
            tokio::spawn(async move {
                tracing::debug!(endpoint = %inner.shared.name, "rejecting connection (too many connections)");
                inner
                    .shared
                    .close_connection(&connection, Some("Too many connections"))
                    .await;
            });
        }
    }

    /// One session: authenticate, serve framed messages, close.
    async fn session(self: Arc<Self>, connection: Arc<Connection>, reader: BoxedReader) {
        if !self.shared.protocol.authenticate(&connection).await {
            tracing::debug!(endpoint = %self.shared.name, "rejecting connection (could not authenticate)");
            self.shared
                .close_connection(&connection, Some("Could not authenticate"))
                .await;
            return;
        }
        tracing::debug!(endpoint = %self.shared.name, "client connection authenticated");

        let eof = self
            .shared
            .receive_loop(connection.clone(), reader)
            .await;
        if eof && !self.shared.shutdown.is_cancelled() {
            self.shared.protocol.handle_peer_disconnect(&connection).await;
        }
        self.shared.close_connection(&connection, None).await;
    }

    /// Graceful endpoint shutdown: flag new work off, cancel session tasks,
    /// close live connections and cancel their handler tasks, then await the
    /// acceptors (closing the listening sockets they own).
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let connections = self.pool.connections();
        self.pool.cancel_sessions();
        for connection in &connections {
            self.shared.close_connection(connection, None).await;
            connection.read_tasks.cancel_all();
            connection.write_tasks.cancel_all();
        }

        let acceptors: Vec<JoinHandle<()>> = self.acceptors.lock().unwrap().drain(..).collect();
        for handle in &acceptors {
            handle.abort();
        }
        for handle in acceptors {
            let _ = handle.await;
        }
        self.pool.clear();
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint()
    }
}
