use super::{ServerInner, ServerOptions};
use crate::connection::{BoxedReader, Connection, ConnectionMode, PeerInfo};
use crate::errors::Error;
use crate::message::Endpoint;
use crate::pool::ConnectionPool;
use crate::protocol::Protocol;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio_rustls::TlsAcceptor;

pub struct UxdServerConfig {
    /// Filesystem path of the socket. A stale socket file is removed; a
    /// directory in the way refuses the bind.
    pub path: PathBuf,
    /// Restrict the socket to the owning user (mode 0600).
    pub user_only: bool,
    /// Restrict the socket to the owning group (mode 0660).
    pub group_only: bool,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub options: ServerOptions,
}

impl UxdServerConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            user_only: false,
            group_only: false,
            tls: None,
            options: ServerOptions::default(),
        }
    }
}

/// A server bound to a Unix-domain socket. Peer processes are identified via
/// SO_PEERCRED; socket access can be restricted to the owning user or group.
pub struct UxdServer {
    inner: Arc<ServerInner>,
    path: PathBuf,
}

impl UxdServer {
    pub async fn bind(
        config: UxdServerConfig,
        protocol: Option<Arc<dyn Protocol>>,
    ) -> Result<Self, Error> {
        let path = config.path.clone();
        if path.exists() {
            if path.is_dir() {
                return Err(Error::SocketCreation(format!(
                    "\"{}\" is a directory",
                    path.display()
                )));
            }
            std::fs::remove_file(&path).map_err(|err| {
                Error::SocketCreation(format!(
                    "cannot delete stale socket file \"{}\" ({err})",
                    path.display()
                ))
            })?;
        }

        let listener = UnixListener::bind(&path).map_err(|err| {
            Error::SocketCreation(format!(
                "cannot bind UXD socket \"{}\" ({err})",
                path.display()
            ))
        })?;

        // Access restrictions on the socket file itself.
        use std::os::unix::fs::PermissionsExt;
        let mode = if config.user_only {
            Some(0o600)
        } else if config.group_only {
            Some(0o660)
        } else {
            None
        };
        if let Some(mode) = mode {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(
                |err| {
                    Error::SocketCreation(format!(
                        "cannot restrict socket file \"{}\" ({err})",
                        path.display()
                    ))
                },
            )?;
        }

        let inner = ServerInner::new("UxdServer", &config.options, protocol);
        let acceptor = config.tls.clone().map(TlsAcceptor::from);
        let mode = config.options.mode;

        let accept_inner = inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_inner.shared.shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        accept(&accept_inner, stream, acceptor.clone(), mode).await;
                    }
                }
            }
            // The listener drops here; close() removes the socket file.
        });
        inner.track_acceptor(handle);

        tracing::debug!(
            path = %path.display(),
            tls = config.tls.is_some(),
            "server bound to UXD socket"
        );
        Ok(Self { inner, path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint()
    }

    pub async fn send_message(
        &self,
        text: &str,
        connection: &Arc<Connection>,
        blocking: bool,
    ) -> bool {
        self.endpoint().send(text, connection, blocking).await
    }

    pub async fn broadcast(
        &self,
        text: &str,
        connections: &[Arc<Connection>],
        blocking: bool,
    ) -> bool {
        self.endpoint().broadcast(text, connections, blocking).await
    }

    /// Gracefully stops the server and removes the socket file.
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.shutdown().await;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::SocketShutdown(err.to_string())),
        }
        tracing::debug!(path = %self.path.display(), "closed UXD socket");
        Ok(())
    }
}

/// Assembles the connection record for one accepted stream and hands it to
/// the session machinery.
async fn accept(
    inner: &Arc<ServerInner>,
    stream: UnixStream,
    acceptor: Option<TlsAcceptor>,
    mode: ConnectionMode,
) {
    let mut peer = PeerInfo::default();
    match stream.peer_cred() {
        Ok(cred) => {
            peer.pid = cred.pid();
            peer.uid = Some(cred.uid());
            peer.gid = Some(cred.gid());
        }
        // Peer credentials are best-effort; the connection proceeds without.
        Err(err) => tracing::warn!(
            error = %crate::Error::UnsupportedOs(err.to_string()),
            "cannot read peer credentials"
        ),
    }

    let (connection, reader): (Arc<Connection>, BoxedReader) = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => {
                peer.tls = true;
                peer.peer_cert = stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(|cert| cert.as_ref().to_vec());
                let (read, write) = tokio::io::split(stream);
                (
                    Connection::new(peer, mode, Box::new(write)),
                    Box::new(read),
                )
            }
            Err(err) => {
                tracing::warn!(error = %err, "TLS handshake failed");
                return;
            }
        },
        None => {
            let (read, write) = stream.into_split();
            (
                Connection::new(peer, mode, Box::new(write)),
                Box::new(read),
            )
        }
    };
    inner.launch(connection, reader);
}
