use crate::connection::{BoxedReader, Connection, ConnectionMode};
use crate::framing::Framing;
use crate::message::{Endpoint, Message};
use crate::protocol::Protocol;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Grace period between writing EOF and dropping the writer, giving the
/// peer a moment to observe the shutdown.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Internal read cap for bulk framing without a limit.
const BULK_CAP: usize = 64 * 1024;

/// State shared between the public endpoint types and everything spawned on
/// their behalf: framing, limits, the protocol, and the shutdown token which
/// gates new work.
pub(crate) struct Shared {
    pub name: String,
    pub limit: Option<usize>,
    pub framing: Framing,
    pub protocol: Arc<dyn Protocol>,
    pub shutdown: CancellationToken,
}

impl Shared {
    pub fn new(
        name: impl Into<String>,
        limit: Option<usize>,
        framing: Framing,
        protocol: Arc<dyn Protocol>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            limit,
            framing,
            protocol,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn endpoint(self: &Arc<Self>) -> Endpoint {
        Endpoint {
            shared: self.clone(),
        }
    }

    /// Encodes and dispatches a message to the given connections. Messages
    /// over the limit go through the limit-exceedance hook and are refused.
    pub async fn send(
        self: &Arc<Self>,
        text: &str,
        connections: &[Arc<Connection>],
        blocking: bool,
    ) -> bool {
        let mut payload = text.as_bytes().to_vec();
        if let Framing::Lines { separator } = self.framing {
            if payload.last() != Some(&separator) {
                payload.push(separator);
            }
        }
        if payload.is_empty() {
            return false;
        }
        if let Some(limit) = self.limit {
            if payload.len() > limit {
                tracing::debug!(
                    endpoint = %self.name,
                    error = %crate::Error::MessageLimitOverrun { limit },
                    "refusing outbound message"
                );
                for connection in connections {
                    self.protocol
                        .handle_limit_exceedance(connection, &payload, false, limit)
                        .await;
                }
                return false;
            }
        }

        let live: Vec<Arc<Connection>> = connections
            .iter()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect();
        if live.is_empty() || self.shutdown.is_cancelled() {
            return false;
        }

        let payload = Bytes::from(payload);
        if blocking {
            let writes = live
                .iter()
                .map(|connection| self.dispatch(payload.clone(), connection.clone()));
            futures::future::join_all(writes)
                .await
                .into_iter()
                .all(|ok| ok)
        } else {
            for connection in live {
                let shared = self.clone();
                let payload = payload.clone();
                let target = connection.clone();
                connection.write_tasks.spawn(async move {
                    shared.dispatch(payload, target).await;
                });
            }
            true
        }
    }

    /// Writes one payload through the connection's serialized writer and
    /// drains it. Ephemeral connections close right after the write.
    async fn dispatch(self: &Arc<Self>, payload: Bytes, connection: Arc<Connection>) -> bool {
        let ok = {
            let mut writer = connection.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => {
                    writer.write_all(&payload).await.is_ok() && writer.flush().await.is_ok()
                }
                None => false,
            }
        };
        if !ok {
            tracing::debug!(
                endpoint = %self.name,
                error = %crate::Error::MessageWriter("connection writer unavailable".into()),
                "message dispatch failed"
            );
            self.protocol.handle_connection_failure(&connection).await;
        } else if connection.mode() == ConnectionMode::Ephemeral {
            self.close_connection(&connection, None).await;
        }
        ok
    }

    /// Closes a connection: optionally tells the peer a short reason, writes
    /// EOF, sleeps briefly so the peer observes it, then drops the writer.
    pub async fn close_connection(self: &Arc<Self>, connection: &Arc<Connection>, reason: Option<&str>) {
        if !connection.stamp_closed() {
            return;
        }
        if let Some(reason) = reason {
            let mut payload = reason.as_bytes().to_vec();
            if let Framing::Lines { separator } = self.framing {
                if payload.last() != Some(&separator) {
                    payload.push(separator);
                }
            }
            let mut writer = connection.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                let _ = writer.write_all(&payload).await;
                let _ = writer.flush().await;
            }
        }
        let taken = { connection.writer.lock().await.take() };
        if let Some(mut writer) = taken {
            let _ = writer.shutdown().await;
            tokio::time::sleep(CLOSE_GRACE).await;
            drop(writer);
        }
        tracing::debug!(endpoint = %self.name, "transport connection closed");
    }

    /// Hands one received message to the protocol on a tracked task, unless
    /// the endpoint is shutting down or the connection is closing.
    fn deliver(self: &Arc<Self>, connection: &Arc<Connection>, data: Vec<u8>) {
        connection.touch();
        if self.shutdown.is_cancelled() || connection.is_closed() {
            return;
        }
        let message = Message {
            data: Bytes::from(data),
            sender: connection.clone(),
            endpoint: self.endpoint(),
        };
        let protocol = self.protocol.clone();
        connection.read_tasks.spawn(async move {
            protocol.handle_message(message).await;
        });
    }

    /// Reads framed messages until EOF, a fatal read error, the limit, or
    /// shutdown. Returns true when the loop ended because the peer hung up.
    pub async fn receive_loop(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        reader: BoxedReader,
    ) -> bool {
        match self.framing {
            Framing::Chunked { chunksize } => {
                self.receive_chunked(connection, reader, chunksize).await
            }
            Framing::Lines { separator } => self.receive_lines(connection, reader, separator).await,
            Framing::Bulk => self.receive_bulk(connection, reader).await,
        }
    }

    async fn receive_chunked(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        mut reader: BoxedReader,
        chunksize: usize,
    ) -> bool {
        if chunksize == 0 {
            return false;
        }
        if let Some(limit) = self.limit {
            if limit < chunksize {
                tracing::error!(
                    endpoint = %self.name,
                    limit,
                    chunksize,
                    "connection limit is smaller than the chunk size; refusing connection"
                );
                return false;
            }
        }
        let mut consumed = 0usize;
        loop {
            let want = match self.limit {
                Some(limit) => {
                    let rest = limit - consumed;
                    if rest == 0 {
                        tracing::debug!(
                            endpoint = %self.name,
                            limit,
                            "connection limit reached; closing connection"
                        );
                        return false;
                    }
                    chunksize.min(rest)
                }
                None => chunksize,
            };
            let mut buffer = vec![0u8; want];
            match reader.read(&mut buffer).await {
                Ok(0) => return true,
                Ok(read) => {
                    consumed += read;
                    buffer.truncate(read);
                    self.deliver(&connection, buffer);
                }
                Err(err) => {
                    tracing::error!(
                        endpoint = %self.name,
                        error = %crate::Error::MessageReader(err.to_string()),
                        "transport error"
                    );
                    return false;
                }
            }
        }
    }

    async fn receive_lines(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        reader: BoxedReader,
        separator: u8,
    ) -> bool {
        let mut reader = tokio::io::BufReader::new(reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(separator, &mut buffer).await {
                Ok(0) => return true,
                Ok(_) => {
                    if buffer.last() != Some(&separator) {
                        // A partial record at EOF is dropped.
                        return true;
                    }
                    if let Some(limit) = self.limit {
                        if buffer.len() > limit {
                            self.protocol
                                .handle_limit_exceedance(&connection, &buffer, true, limit)
                                .await;
                            continue;
                        }
                    }
                    self.deliver(&connection, buffer.clone());
                }
                Err(err) => {
                    tracing::error!(
                        endpoint = %self.name,
                        error = %crate::Error::MessageReader(err.to_string()),
                        "transport error"
                    );
                    return false;
                }
            }
        }
    }

    async fn receive_bulk(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        mut reader: BoxedReader,
    ) -> bool {
        let cap = self.limit.unwrap_or(BULK_CAP).max(1);
        loop {
            let mut buffer = vec![0u8; cap];
            match reader.read(&mut buffer).await {
                Ok(0) => return true,
                Ok(read) => {
                    buffer.truncate(read);
                    self.deliver(&connection, buffer);
                }
                Err(err) => {
                    tracing::error!(
                        endpoint = %self.name,
                        error = %crate::Error::MessageReader(err.to_string()),
                        "transport error"
                    );
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::PeerInfo;
    use async_trait::async_trait;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::sync::mpsc;

    /// Collects every received message into a channel.
    struct Collect {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        overruns: AtomicUsize,
    }

    #[async_trait]
    impl Protocol for Collect {
        async fn handle_message(&self, message: Message) {
            let _ = self.tx.send(message.data.to_vec());
        }

        async fn handle_limit_exceedance(
            &self,
            _connection: &Arc<Connection>,
            _message: &[u8],
            _inbound: bool,
            _limit: usize,
        ) {
            self.overruns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn harness(
        limit: Option<usize>,
        framing: Framing,
    ) -> (
        Arc<Shared>,
        Arc<Collect>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let protocol = Arc::new(Collect {
            tx,
            overruns: AtomicUsize::new(0),
        });
        let shared = Shared::new("TestEndpoint", limit, framing, protocol.clone());
        (shared, protocol, rx)
    }

    fn connection(mode: ConnectionMode) -> Arc<Connection> {
        Connection::new(PeerInfo::default(), mode, Box::new(tokio::io::sink()))
    }

    /// Counts the read calls passing through to an inner reader.
    struct CountingReader<R> {
        inner: R,
        reads: Arc<AtomicUsize>,
    }

    impl<R: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for CountingReader<R> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let before = buf.filled().len();
            let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
            if let Poll::Ready(Ok(())) = &poll {
                if buf.filled().len() > before {
                    self.reads.fetch_add(1, Ordering::SeqCst);
                }
            }
            poll
        }
    }

    #[tokio::test]
    async fn test_line_framing_delivers_in_order() {
        let (shared, _protocol, mut rx) = harness(None, Framing::lines());
        let connection = connection(ConnectionMode::Persistent);

        let (client, server) = tokio::io::duplex(256);
        let (mut client_write, server_read) = (client, server);
        client_write.write_all(b"A\nBB\nCCC\n").await.unwrap();
        client_write.shutdown().await.unwrap();

        let eof = shared
            .receive_loop(connection.clone(), Box::new(server_read))
            .await;
        assert!(eof);

        for expected in [&b"A\n"[..], b"BB\n", b"CCC\n"] {
            let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn test_line_overrun_drops_and_continues() {
        let (shared, protocol, mut rx) = harness(Some(4), Framing::lines());
        let connection = connection(ConnectionMode::Persistent);

        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"toolong\nok\n").await.unwrap();
        client.shutdown().await.unwrap();

        assert!(shared.receive_loop(connection, Box::new(server)).await);
        let got = rx.recv().await.unwrap();
        assert_eq!(got, b"ok\n");
        assert_eq!(protocol.overruns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chunked_framing_read_budget() {
        // limit = 10, chunksize = 4: exactly ceil(10 / 4) = 3 reads occur
        // before the connection closes.
        let (shared, _protocol, mut rx) = harness(Some(10), Framing::Chunked { chunksize: 4 });
        let connection = connection(ConnectionMode::Persistent);

        let (mut client, server) = tokio::io::duplex(16);
        let reads = Arc::new(AtomicUsize::new(0));
        let reader = CountingReader {
            inner: server,
            reads: reads.clone(),
        };

        let writer = tokio::spawn(async move {
            // More data than the limit permits.
            client.write_all(&[b'x'; 32]).await.unwrap();
            client
        });

        let eof = shared.receive_loop(connection, Box::new(reader)).await;
        assert!(!eof, "the limit closes the connection before EOF");
        assert_eq!(reads.load(Ordering::SeqCst), 3);

        let mut received = 0;
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            received += chunk.len();
        }
        assert_eq!(received, 10);
        writer.abort();
    }

    #[tokio::test]
    async fn test_chunksize_larger_than_limit_refuses() {
        let (shared, _protocol, _rx) = harness(Some(2), Framing::Chunked { chunksize: 8 });
        let connection = connection(ConnectionMode::Persistent);
        let (_client, server) = tokio::io::duplex(16);
        assert!(!shared.receive_loop(connection, Box::new(server)).await);
    }

    #[tokio::test]
    async fn test_send_appends_separator_and_respects_limit() {
        let (shared, protocol, _rx) = harness(Some(8), Framing::lines());

        let (client, server) = tokio::io::duplex(256);
        let (mut client_read, _client_write) = tokio::io::split(client);
        let (_server_read, server_write) = tokio::io::split(server);
        let connection = Connection::new(
            PeerInfo::default(),
            ConnectionMode::Persistent,
            Box::new(server_write),
        );

        assert!(shared.send("hi", &[connection.clone()], true).await);
        let mut buffer = [0u8; 3];
        client_read.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"hi\n");

        // An over-limit outbound message is refused through the hook.
        assert!(!shared.send("far too long", &[connection], true).await);
        assert_eq!(protocol.overruns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_connection_closes_after_write() {
        let (shared, _protocol, _rx) = harness(None, Framing::lines());

        let (client, server) = tokio::io::duplex(256);
        let (mut client_read, _client_write) = tokio::io::split(client);
        let (_server_read, server_write) = tokio::io::split(server);
        let connection = Connection::new(
            PeerInfo::default(),
            ConnectionMode::Ephemeral,
            Box::new(server_write),
        );

        assert!(shared.send("bye", &[connection.clone()], true).await);
        assert!(connection.is_closed());

        // The peer reads the message, then EOF.
        let mut buffer = Vec::new();
        client_read.read_to_end(&mut buffer).await.unwrap();
        assert_eq!(buffer, b"bye\n");
    }

    #[tokio::test]
    async fn test_broadcast_blocking_gathers_all() {
        let (shared, _protocol, _rx) = harness(None, Framing::lines());

        let mut peers = Vec::new();
        let mut connections = Vec::new();
        for _ in 0..3 {
            let (client, server) = tokio::io::duplex(256);
            let (_server_read, server_write) = tokio::io::split(server);
            peers.push(client);
            connections.push(Connection::new(
                PeerInfo::default(),
                ConnectionMode::Persistent,
                Box::new(server_write),
            ));
        }
        assert!(shared.send("all", &connections, true).await);
        for peer in &mut peers {
            let mut buffer = [0u8; 4];
            peer.read_exact(&mut buffer).await.unwrap();
            assert_eq!(&buffer, b"all\n");
        }

        // One closed connection fails the blocking broadcast.
        shared.close_connection(&connections[0], None).await;
        let survivors = shared.send("again", &connections, true).await;
        assert!(survivors, "closed connections are filtered, not failures");
    }
}
