//! Generic, non-blocking socket transport for daemon endpoints.
//!
//! Servers and clients speak over Unix-domain or TCP sockets, optionally
//! secured with TLS, with one of three framing strategies cutting the byte
//! stream into opaque messages: bulk reads, line-delimited records, or
//! fixed-size chunks. Connections carry rich peer identity (UXD peer
//! credentials, TCP addresses, TLS certificates) and register in an indexed
//! [`ConnectionPool`] with an optional capacity. An application [`Protocol`]
//! plugs into the seams: authentication, message handling, disconnects and
//! limit exceedances.

pub mod client;
mod connection;
mod endpoint;
mod errors;
mod framing;
mod message;
mod pool;
mod protocol;
pub mod server;
pub mod tls;

pub use connection::{Connection, ConnectionMode, PeerInfo};
pub use errors::Error;
pub use framing::Framing;
pub use message::{Endpoint, Message};
pub use pool::ConnectionPool;
pub use protocol::Protocol;
