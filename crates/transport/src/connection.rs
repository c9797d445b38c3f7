use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::AbortHandle;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Whether a connection serves messages until EOF or closes right after its
/// first reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Ephemeral,
    Persistent,
}

/// Peer identity of a connection: process credentials for UXD peers,
/// addresses for TCP peers, certificate when TLS-secured.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub pid: Option<i32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub peer_address: Option<SocketAddr>,
    pub host_address: Option<SocketAddr>,
    /// DER-encoded certificate the peer presented during the TLS handshake.
    pub peer_cert: Option<Vec<u8>>,
    pub tls: bool,
}

/// One live transport session. The writer half is serialized behind an async
/// mutex; the reader half is owned by the session's receive loop. Message
/// handler tasks launched for this connection register in the read/write
/// task sets and deregister themselves on completion.
pub struct Connection {
    peer: PeerInfo,
    mode: ConnectionMode,
    pub(crate) writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    created: Instant,
    updated: Mutex<Instant>,
    closed: Mutex<Option<Instant>>,
    pub(crate) read_tasks: Arc<TaskSet>,
    pub(crate) write_tasks: Arc<TaskSet>,
}

impl Connection {
    pub(crate) fn new(peer: PeerInfo, mode: ConnectionMode, writer: BoxedWriter) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            peer,
            mode,
            writer: tokio::sync::Mutex::new(Some(writer)),
            created: now,
            updated: Mutex::new(now),
            closed: Mutex::new(None),
            read_tasks: Arc::new(TaskSet::default()),
            write_tasks: Arc::new(TaskSet::default()),
        })
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn created_at(&self) -> Instant {
        self.created
    }

    /// `None` exactly while the connection is live.
    pub fn closed_at(&self) -> Option<Instant> {
        *self.closed.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at().is_some()
    }

    /// Stamps the close timestamp; true only for the first caller.
    pub(crate) fn stamp_closed(&self) -> bool {
        let mut closed = self.closed.lock().unwrap();
        if closed.is_some() {
            return false;
        }
        *closed = Some(Instant::now());
        true
    }

    pub(crate) fn touch(&self) {
        *self.updated.lock().unwrap() = Instant::now();
    }

    /// Time since the last inbound activity.
    pub fn idle_for(&self) -> Duration {
        self.updated.lock().unwrap().elapsed()
    }

    /// Outstanding message-handler tasks reading for this connection.
    pub fn outstanding_readers(&self) -> usize {
        self.read_tasks.len()
    }

    /// Outstanding write tasks dispatching to this connection.
    pub fn outstanding_writers(&self) -> usize {
        self.write_tasks.len()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A set of in-flight tasks which deregister themselves on completion and
/// can be cancelled as a group on shutdown.
#[derive(Default)]
pub(crate) struct TaskSet {
    next: AtomicU64,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl TaskSet {
    /// Spawns a tracked task. Holding the set lock across the spawn orders
    /// the task's self-removal after our insertion.
    pub fn spawn<F>(self: &Arc<Self>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let mut tasks = self.tasks.lock().unwrap();
        let set = Arc::clone(self);
        let handle = tokio::spawn(async move {
            future.await;
            set.tasks.lock().unwrap().remove(&id);
        });
        tasks.insert(id, handle.abort_handle());
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.tasks.lock().unwrap().drain() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_deregister_on_completion() {
        let set = Arc::new(TaskSet::default());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        set.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(set.len(), 1);

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(set.len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_aborts_pending_tasks() {
        let set = Arc::new(TaskSet::default());
        for _ in 0..3 {
            set.spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
        assert_eq!(set.len(), 3);
        set.cancel_all();
        assert_eq!(set.len(), 0);
    }
}
