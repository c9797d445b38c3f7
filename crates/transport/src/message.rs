use crate::connection::Connection;
use crate::endpoint::Shared;
use bytes::Bytes;
use std::sync::Arc;

/// One framed message received by an endpoint, together with its sender and
/// a handle back to the endpoint for replies.
pub struct Message {
    pub data: Bytes,
    pub sender: Arc<Connection>,
    pub(crate) endpoint: Endpoint,
}

impl Message {
    /// The message bytes as lossless UTF-8, if they are.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Sends a reply to the message's sender, awaiting the write.
    pub async fn respond(&self, text: &str) -> bool {
        self.endpoint.send(text, &self.sender, true).await
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("data", &self.data)
            .field("sender", &self.sender)
            .finish()
    }
}

/// A cloneable handle onto a transport endpoint, for protocols and
/// application code to send messages and close connections through.
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) shared: Arc<Shared>,
}

impl Endpoint {
    /// Sends a message to one connection. Non-blocking sends launch a
    /// tracked write task and report true; blocking sends report the actual
    /// write result.
    pub async fn send(&self, text: &str, connection: &Arc<Connection>, blocking: bool) -> bool {
        self.shared
            .send(text, std::slice::from_ref(connection), blocking)
            .await
    }

    /// Sends a message to many connections, dispatching concurrently. The
    /// blocking form is true iff every dispatch succeeded.
    pub async fn broadcast(
        &self,
        text: &str,
        connections: &[Arc<Connection>],
        blocking: bool,
    ) -> bool {
        self.shared.send(text, connections, blocking).await
    }

    /// Closes a connection, optionally sending a short reason first.
    pub async fn close_connection(&self, connection: &Arc<Connection>, reason: Option<&str>) {
        self.shared.close_connection(connection, reason).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}
