use crate::connection::Connection;
use crate::errors::Error;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

struct Session {
    connection: Arc<Connection>,
    abort: AbortHandle,
}

struct PoolInner {
    max: Option<usize>,
    sessions: HashMap<u64, Session>,
}

/// The registry of live sessions of one transport endpoint, with an optional
/// capacity. Each entry pairs the connection with its session task; sessions
/// remove themselves when their task completes or is cancelled.
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    next: AtomicU64,
}

impl ConnectionPool {
    pub fn new(max: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                max,
                sessions: HashMap::new(),
            }),
            next: AtomicU64::new(0),
        })
    }

    pub fn max(&self) -> Option<usize> {
        self.inner.lock().unwrap().max
    }

    /// Raises (or sets) the capacity. Fails when the new maximum does not
    /// exceed the number of currently active sessions.
    pub fn set_max(&self, max: usize) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if max > inner.sessions.len() {
            inner.max = Some(max);
            Ok(())
        } else {
            Err(Error::ConnectionPoolMax)
        }
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.max.map_or(false, |max| inner.sessions.len() >= max)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admits a connection and spawns its session task, atomically against
    /// the capacity check. Returns false (spawning nothing) when the pool is
    /// full. The session removes itself when the task finishes or is
    /// cancelled.
    pub(crate) fn spawn_session<F>(self: &Arc<Self>, connection: Arc<Connection>, session: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.max.map_or(false, |max| inner.sessions.len() >= max) {
            return false;
        }
        let key = self.next.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = SessionGuard { pool, key };
            session.await;
        });
        inner.sessions.insert(
            key,
            Session {
                connection,
                abort: handle.abort_handle(),
            },
        );
        true
    }

    fn remove(&self, key: u64) {
        self.inner.lock().unwrap().sessions.remove(&key);
    }

    /// Cancels every session task. Their guards remove the entries.
    pub(crate) fn cancel_sessions(&self) {
        for session in self.inner.lock().unwrap().sessions.values() {
            session.abort.abort();
        }
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().sessions.clear();
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .map(|s| s.connection.clone())
            .collect()
    }

    fn select(&self, keep: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| keep(&s.connection))
            .map(|s| s.connection.clone())
            .collect()
    }

    /// Active connections from the given peer address.
    pub fn by_address(&self, address: &SocketAddr) -> Vec<Arc<Connection>> {
        self.select(|c| c.peer().peer_address.as_ref() == Some(address))
    }

    /// Active connections of the given user ID.
    pub fn by_user(&self, uid: u32) -> Vec<Arc<Connection>> {
        self.select(|c| c.peer().uid == Some(uid))
    }

    /// Active connections of the given group ID.
    pub fn by_group(&self, gid: u32) -> Vec<Arc<Connection>> {
        self.select(|c| c.peer().gid == Some(gid))
    }

    /// Active connections of the given process ID.
    pub fn by_process(&self, pid: i32) -> Vec<Arc<Connection>> {
        self.select(|c| c.peer().pid == Some(pid))
    }

    /// Active connections idling at least as long as `period`.
    pub fn idle_since(&self, period: Duration) -> Vec<Arc<Connection>> {
        self.select(|c| c.idle_for() >= period)
    }
}

struct SessionGuard {
    pool: Arc<ConnectionPool>,
    key: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.pool.remove(self.key);
    }
}
