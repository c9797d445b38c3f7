//! TLS configuration helpers for transport endpoints, built on rustls with
//! PEM material loaded via rustls-pemfile.

use crate::errors::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Installs the process-default crypto provider. Idempotent; endpoints using
/// TLS call this (or the composing binary does) before building configs.
pub fn install_default_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

pub fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut io::BufReader::new(File::open(path)?)).collect()
}

pub fn load_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut io::BufReader::new(File::open(path)?))?.ok_or(
        io::Error::new(io::ErrorKind::Other, "no private key found".to_string()),
    )
}

fn root_store(path: &Path) -> Result<rustls::RootCertStore, Error> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Builds a server-side TLS configuration from PEM files. With
/// `client_roots` set, peers must present a certificate chaining to one of
/// those anchors (and it becomes available as the connection's peer
/// certificate).
pub fn server_config(
    cert: &Path,
    key: &Path,
    client_roots: Option<&Path>,
) -> Result<Arc<rustls::ServerConfig>, Error> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;
    let builder = rustls::ServerConfig::builder();

    let config = match client_roots {
        Some(path) => {
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store(
                path,
            )?))
            .build()
            .map_err(|err| Error::SocketCreation(format!("client verifier ({err})")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    Ok(Arc::new(config))
}

/// Builds a client-side TLS configuration trusting the given PEM anchors,
/// optionally presenting a client identity.
pub fn client_config(
    roots: &Path,
    identity: Option<(&Path, &Path)>,
) -> Result<Arc<rustls::ClientConfig>, Error> {
    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store(roots)?);
    let config = match identity {
        Some((cert, key)) => {
            builder.with_client_auth_cert(load_certs(cert)?, load_key(key)?)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}
