mod tcp;
mod uxd;

pub use tcp::{TcpClient, TcpClientConfig};
pub use uxd::{UxdClient, UxdClientConfig};

use crate::connection::{BoxedReader, Connection, ConnectionMode};
use crate::endpoint::Shared;
use crate::framing::Framing;
use crate::message::Endpoint;
use crate::protocol::{DefaultProtocol, Protocol};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Options shared by every client flavor.
#[derive(Clone)]
pub struct ClientOptions {
    /// Symmetric per-endpoint message size limit.
    pub limit: Option<usize>,
    pub framing: Framing,
    pub mode: ConnectionMode,
    /// Overall lifetime of the connection handler; the connection closes
    /// when it elapses.
    pub timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            limit: None,
            framing: Framing::default(),
            mode: ConnectionMode::Persistent,
            timeout: None,
        }
    }
}

/// Core shared by the UXD and TCP clients: the single connection, its
/// handler task, and the endpoint state.
pub(crate) struct ClientInner {
    pub shared: Arc<Shared>,
    timeout: Option<Duration>,
    connection: Mutex<Option<Arc<Connection>>>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    pub fn new(
        name: &str,
        options: &ClientOptions,
        protocol: Option<Arc<dyn Protocol>>,
    ) -> Arc<Self> {
        let protocol = protocol.unwrap_or_else(|| Arc::new(DefaultProtocol));
        Arc::new(Self {
            shared: Shared::new(name, options.limit, options.framing, protocol),
            timeout: options.timeout,
            connection: Mutex::new(None),
            handler: Mutex::new(None),
        })
    }

    /// Stores the established connection and spawns its handler task, which
    /// serves the receive loop (bounded by the configured timeout) and
    /// cleans the connection up when it ends.
    pub fn attach(self: &Arc<Self>, connection: Arc<Connection>, reader: BoxedReader) {
        *self.connection.lock().unwrap() = Some(connection.clone());

        let inner = self.clone();
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            let eof = match timeout {
                Some(timeout) => {
                    match tokio::time::timeout(
                        timeout,
                        inner.shared.receive_loop(connection.clone(), reader),
                    )
                    .await
                    {
                        Ok(eof) => eof,
                        Err(_) => {
                            tracing::debug!(
                                endpoint = %inner.shared.name,
                                "connection handler timeout elapsed; closing connection"
                            );
                            false
                        }
                    }
                }
                None => inner.shared.receive_loop(connection.clone(), reader).await,
            };
            if eof {
                inner.shared.protocol.handle_peer_disconnect(&connection).await;
            }
            inner.shared.close_connection(&connection, None).await;
            connection.read_tasks.cancel_all();
            connection.write_tasks.cancel_all();
            *inner.connection.lock().unwrap() = None;
        });
        *self.handler.lock().unwrap() = Some(handle);
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().unwrap().clone()
    }

    /// Whether the connection is established and not closed.
    pub fn connected(&self) -> bool {
        self.connection()
            .map_or(false, |connection| !connection.is_closed())
    }

    pub async fn send(&self, text: &str, blocking: bool) -> bool {
        let Some(connection) = self.connection() else {
            return false;
        };
        self.shared
            .send(text, std::slice::from_ref(&connection), blocking)
            .await
    }

    /// Disconnects: cancels the handler, closes the connection, cancels its
    /// outstanding read and write tasks.
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().unwrap().take();
        let handler = self.handler.lock().unwrap().take();

        let Some(connection) = connection else {
            return;
        };
        if let Some(handler) = &handler {
            handler.abort();
        }
        self.shared.close_connection(&connection, None).await;
        connection.read_tasks.cancel_all();
        connection.write_tasks.cancel_all();
        if let Some(handler) = handler {
            let _ = handler.await;
        }
        tracing::debug!(endpoint = %self.shared.name, "client disconnected");
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint()
    }
}
