use super::{ServerInner, ServerOptions};
use crate::connection::{BoxedReader, Connection, ConnectionMode, PeerInfo};
use crate::errors::Error;
use crate::message::Endpoint;
use crate::pool::ConnectionPool;
use crate::protocol::Protocol;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Address family selection for TCP endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    /// Bind both families: one dual-stack IPv6 socket where the kernel
    /// supports it, two distinct sockets otherwise.
    Dual,
    /// Prefer IPv6 when the host resolves to one.
    Auto,
}

pub struct TcpServerConfig {
    /// Interface addresses to bind; one listening socket per address/family
    /// pair.
    pub addresses: Vec<String>,
    pub port: u16,
    pub family: AddressFamily,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub options: ServerOptions,
}

impl TcpServerConfig {
    pub fn at(address: impl Into<String>, port: u16) -> Self {
        Self {
            addresses: vec![address.into()],
            port,
            family: AddressFamily::Auto,
            tls: None,
            options: ServerOptions::default(),
        }
    }
}

/// A server bound to one or more TCP listening sockets, optionally
/// TLS-terminating.
pub struct TcpServer {
    inner: Arc<ServerInner>,
    local_addrs: Vec<SocketAddr>,
}

impl TcpServer {
    pub async fn bind(
        config: TcpServerConfig,
        protocol: Option<Arc<dyn Protocol>>,
    ) -> Result<Self, Error> {
        let inner = ServerInner::new("TcpServer", &config.options, protocol);
        let acceptor = config.tls.clone().map(TlsAcceptor::from);
        let mode = config.options.mode;

        // Bind every address; per-address failures are logged, the endpoint
        // fails only when nothing could be bound.
        let mut listeners: Vec<TcpListener> = Vec::new();
        for address in &config.addresses {
            let plans = match resolve_bind(address, config.port, config.family) {
                Ok(plans) if !plans.is_empty() => plans,
                Ok(_) => {
                    tracing::error!(
                        address = %address,
                        port = config.port,
                        family = ?config.family,
                        "address not supported by the requested family"
                    );
                    continue;
                }
                Err(err) => {
                    tracing::error!(address = %address, port = config.port, error = %err, "cannot resolve bind address");
                    continue;
                }
            };
            let mut wanted_dual = false;
            let mut got_dual = false;
            for plan in &plans {
                wanted_dual |= plan.dual;
                match bind_socket(plan) {
                    Ok((listener, dual)) => {
                        got_dual |= dual;
                        tracing::debug!(
                            address = %plan.addr,
                            dual_stack = dual,
                            tls = config.tls.is_some(),
                            "server bound to TCP socket"
                        );
                        listeners.push(listener);
                    }
                    Err(err) => {
                        tracing::error!(address = %plan.addr, error = %err, "cannot bind TCP socket");
                    }
                }
            }
            // Dual-stack fallback: bind a distinct IPv4 socket when the
            // kernel did not take IPV6_V6ONLY=0.
            if wanted_dual && !got_dual {
                if let Ok(extra) = resolve_bind(address, config.port, AddressFamily::Ipv4) {
                    for plan in &extra {
                        match bind_socket(plan) {
                            Ok((listener, _)) => {
                                tracing::debug!(address = %plan.addr, "server bound fallback IPv4 TCP socket");
                                listeners.push(listener);
                            }
                            Err(err) => {
                                tracing::error!(address = %plan.addr, error = %err, "cannot bind TCP socket");
                            }
                        }
                    }
                }
            }
        }
        if listeners.is_empty() {
            return Err(Error::SocketCreation(format!(
                "no listening socket for {:?} port {} could be created",
                config.addresses, config.port
            )));
        }

        let mut local_addrs = Vec::new();
        for listener in &listeners {
            local_addrs.push(listener.local_addr()?);
        }

        // Each listening socket runs its own acceptor.
        for listener in listeners {
            let accept_inner = inner.clone();
            let acceptor = acceptor.clone();
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
            });
            inner.track_acceptor(handle);
        }

        Ok(Self { inner, local_addrs })
    }

    /// The bound listening addresses, one per socket.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
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

    /// Gracefully stops the server and closes every listening socket.
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.shutdown().await;
        for addr in &self.local_addrs {
            tracing::debug!(address = %addr, "closed TCP socket");
        }
        Ok(())
    }
}

struct BindPlan {
    addr: SocketAddr,
    /// Ask the kernel for a dual-stack socket (IPV6_V6ONLY = 0).
    dual: bool,
    /// Pin the socket to IPv6 only.
    only_v6: bool,
}

fn resolve_bind(
    address: &str,
    port: u16,
    family: AddressFamily,
) -> std::io::Result<Vec<BindPlan>> {
    use std::net::ToSocketAddrs;
    let all: Vec<SocketAddr> = (address, port).to_socket_addrs()?.collect();
    let v6 = all.iter().find(|a| a.is_ipv6()).cloned();
    let v4 = all.iter().find(|a| a.is_ipv4()).cloned();

    let mut plans = Vec::new();
    match family {
        AddressFamily::Ipv4 => {
            if let Some(addr) = v4 {
                plans.push(BindPlan {
                    addr,
                    dual: false,
                    only_v6: false,
                });
            }
        }
        AddressFamily::Ipv6 => {
            if let Some(addr) = v6 {
                plans.push(BindPlan {
                    addr,
                    dual: false,
                    only_v6: true,
                });
            }
        }
        AddressFamily::Auto => {
            if let Some(addr) = v6.or(v4) {
                plans.push(BindPlan {
                    addr,
                    dual: false,
                    only_v6: false,
                });
            }
        }
        AddressFamily::Dual => {
            if let Some(addr) = v6 {
                plans.push(BindPlan {
                    addr,
                    dual: true,
                    only_v6: false,
                });
            } else if let Some(addr) = v4 {
                plans.push(BindPlan {
                    addr,
                    dual: false,
                    only_v6: false,
                });
            }
        }
    }
    Ok(plans)
}

/// Creates, configures and binds one listening socket. Returns the listener
/// and whether dual-stack was actually enabled.
fn bind_socket(plan: &BindPlan) -> std::io::Result<(TcpListener, bool)> {
    let domain = if plan.addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
    socket.set_reuse_address(true)?;

    let mut dual = false;
    if plan.addr.is_ipv6() {
        if plan.dual {
            dual = socket.set_only_v6(false).is_ok();
        } else if plan.only_v6 {
            socket.set_only_v6(true)?;
        }
    }
    socket.bind(&plan.addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let listener = TcpListener::from_std(socket.into())?;
    Ok((listener, dual))
}

/// Assembles the connection record for one accepted stream and hands it to
/// the session machinery.
async fn accept(
    inner: &Arc<ServerInner>,
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    mode: ConnectionMode,
) {
    let mut peer = PeerInfo {
        peer_address: stream.peer_addr().ok(),
        host_address: stream.local_addr().ok(),
        ..PeerInfo::default()
    };
    let _ = stream.set_nodelay(true);

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
