use super::{ClientInner, ClientOptions};
use crate::connection::{BoxedReader, Connection, PeerInfo};
use crate::errors::Error;
use crate::message::Endpoint;
use crate::protocol::Protocol;
use crate::server::AddressFamily;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub struct TcpClientConfig {
    pub address: String,
    pub port: u16,
    /// IPV4, IPV6 or AUTO; a client picks one address, so DUAL resolves
    /// like AUTO.
    pub family: AddressFamily,
    /// TLS configuration plus the server name presented for SNI and
    /// certificate verification. Defaults to the address when empty.
    pub tls: Option<(Arc<rustls::ClientConfig>, String)>,
    pub options: ClientOptions,
}

impl TcpClientConfig {
    pub fn at(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            family: AddressFamily::Auto,
            tls: None,
            options: ClientOptions::default(),
        }
    }
}

/// A client connecting to a transport server over TCP, with the same
/// address-family resolution as the server (preferring IPv6 in AUTO mode).
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl TcpClient {
    pub async fn connect(
        config: TcpClientConfig,
        protocol: Option<Arc<dyn Protocol>>,
    ) -> Result<Self, Error> {
        let target = resolve_connect(&config.address, config.port, config.family)?;
        let stream = TcpStream::connect(target).await.map_err(|err| {
            Error::SocketCreation(format!(
                "cannot connect to TCP address \"{target}\" ({err})"
            ))
        })?;
        let _ = stream.set_nodelay(true);

        let mut peer = PeerInfo {
            peer_address: stream.peer_addr().ok(),
            host_address: stream.local_addr().ok(),
            ..PeerInfo::default()
        };

        let inner = ClientInner::new("TcpClient", &config.options, protocol);
        let mode = config.options.mode;

        let (connection, reader): (Arc<Connection>, BoxedReader) = match &config.tls {
            Some((tls, server_name)) => {
                let name = if server_name.is_empty() {
                    config.address.clone()
                } else {
                    server_name.clone()
                };
                let name = ServerName::try_from(name).map_err(|err| {
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
        tracing::debug!(address = %target, "connected to TCP server");
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

/// Picks the one address a client connects to, preferring IPv6 unless the
/// family pins IPv4.
fn resolve_connect(address: &str, port: u16, family: AddressFamily) -> Result<SocketAddr, Error> {
    use std::net::ToSocketAddrs;
    let all: Vec<SocketAddr> = (address, port)
        .to_socket_addrs()
        .map_err(|err| {
            Error::SocketCreation(format!(
                "cannot resolve address \"{address}:{port}\" ({err})"
            ))
        })?
        .collect();

    let picked = match family {
        AddressFamily::Ipv4 => all.iter().find(|a| a.is_ipv4()),
        AddressFamily::Ipv6 => all.iter().find(|a| a.is_ipv6()),
        AddressFamily::Auto | AddressFamily::Dual => all
            .iter()
            .find(|a| a.is_ipv6())
            .or_else(|| all.iter().find(|a| a.is_ipv4())),
    };
    picked.cloned().ok_or_else(|| {
        Error::SocketCreation(format!(
            "address \"{address}:{port}\" is not supported by family {family:?}"
        ))
    })
}
