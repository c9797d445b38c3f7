use super::{ClientInner, ClientOptions};
use crate::connection::{BoxedReader, Connection, PeerInfo};
use crate::errors::Error;
use crate::message::Endpoint;
use crate::protocol::Protocol;
use rustls::pki_types::ServerName;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio_rustls::TlsConnector;

pub struct UxdClientConfig {
    pub path: PathBuf,
    /// TLS configuration plus the server name presented for verification.
    pub tls: Option<(Arc<rustls::ClientConfig>, String)>,
    pub options: ClientOptions,
}

impl UxdClientConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tls: None,
            options: ClientOptions::default(),
        }
    }
}

/// A client connecting to a transport server over a Unix-domain socket.
pub struct UxdClient {
    inner: Arc<ClientInner>,
}

impl UxdClient {
    pub async fn connect(
        config: UxdClientConfig,
        protocol: Option<Arc<dyn Protocol>>,
    ) -> Result<Self, Error> {
        let stream = UnixStream::connect(&config.path).await.map_err(|err| {
            Error::SocketCreation(format!(
                "cannot connect to UXD socket \"{}\" ({err})",
                config.path.display()
            ))
        })?;

        // The connection record carries this side's own credentials.
        let mut peer = PeerInfo {
            pid: Some(std::process::id() as i32),
            ..PeerInfo::default()
        };
        // Safety: getuid/getgid cannot fail.
        peer.uid = Some(unsafe { libc::getuid() });
        peer.gid = Some(unsafe { libc::getgid() });

        let inner = ClientInner::new("UxdClient", &config.options, protocol);
        let mode = config.options.mode;

        let (connection, reader): (Arc<Connection>, BoxedReader) = match &config.tls {
            Some((tls, server_name)) => {
                let name = ServerName::try_from(server_name.clone()).map_err(|err| {
                    Error::SocketCreation(format!("invalid TLS server name ({err})"))
                })?;
                let connector = TlsConnector::from(tls.clone());
                let stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|err| Error::SocketCreation(format!("TLS handshake failed ({err})")))?;
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
            None => {
                let (read, write) = stream.into_split();
                (
                    Connection::new(peer, mode, Box::new(write)),
                    Box::new(read),
                )
            }
        };

        inner.attach(connection, reader);
        tracing::debug!(path = %config.path.display(), "connected to UXD socket");
        Ok(Self { inner })
    }

    pub fn connected(&self) -> bool {
        self.inner.connected()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.connection()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint()
    }

    pub async fn send_message(&self, text: &str, blocking: bool) -> bool {
        self.inner.send(text, blocking).await
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }
}
