use crate::connection::Connection;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;

/// An application protocol plugged into a transport endpoint. Every handler
/// has a default, so a protocol implements only the seams it cares about;
/// absent a protocol entirely, endpoints log and accept.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Authenticates a freshly accepted connection. Rejections close it with
    /// a short reason.
    async fn authenticate(&self, _connection: &Arc<Connection>) -> bool {
        true
    }

    /// Handles one received message.
    async fn handle_message(&self, message: Message) {
        tracing::debug!(received = %preview(&message.data), "transport received message");
    }

    /// Called when a connection turns out dead on use.
    async fn handle_connection_failure(&self, _connection: &Arc<Connection>) {
        tracing::debug!("transport detected a failed connection");
    }

    /// Called when the peer hangs up.
    async fn handle_peer_disconnect(&self, _connection: &Arc<Connection>) {
        tracing::debug!("transport peer disconnected");
    }

    /// Called for in- or outbound messages exceeding the endpoint limit. The
    /// message is dropped either way; inbound connections stay open.
    async fn handle_limit_exceedance(
        &self,
        _connection: &Arc<Connection>,
        message: &[u8],
        inbound: bool,
        limit: usize,
    ) {
        tracing::warn!(
            inbound,
            limit,
            message = %preview(message),
            "message size exceeds the endpoint limit"
        );
    }
}

/// The log-and-accept stand-in used when no protocol is configured.
pub(crate) struct DefaultProtocol;

impl Protocol for DefaultProtocol {}

/// A short lossy preview of message bytes for log lines.
pub(crate) fn preview(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    let trimmed = text.trim_end_matches(['\r', '\n']);
    if trimmed.len() > 50 {
        let mut cut = 47;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &trimmed[..cut])
    } else {
        trimmed.to_string()
    }
}
