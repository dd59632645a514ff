//! TLS contexts built from in-memory PEM material

use std::io;

use native_tls::{Certificate, Identity, TlsAcceptor, TlsConnector};

use crate::datalink::bsc::config::TlsCredentials;

fn tls_error(what: &str, e: native_tls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", what, e))
}

fn identity(credentials: &TlsCredentials) -> io::Result<Identity> {
    Identity::from_pkcs8(&credentials.cert, &credentials.key)
        .map_err(|e| tls_error("failed to create identity", e))
}

/// Connector presenting our certificate and trusting only the configured CA
///
/// BACnet/SC peers are identified by certificate, not host name, so host
/// name verification is off.
pub(crate) fn connector(credentials: &TlsCredentials) -> io::Result<TlsConnector> {
    let ca_cert = Certificate::from_pem(&credentials.ca_cert)
        .map_err(|e| tls_error("failed to parse CA cert", e))?;

    TlsConnector::builder()
        .identity(identity(credentials)?)
        .add_root_certificate(ca_cert)
        .disable_built_in_roots(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| tls_error("failed to build TLS connector", e))
}

pub(crate) fn acceptor(credentials: &TlsCredentials) -> io::Result<TlsAcceptor> {
    // Parse the CA so bad material fails at start rather than per connection.
    Certificate::from_pem(&credentials.ca_cert)
        .map_err(|e| tls_error("failed to parse CA cert", e))?;

    TlsAcceptor::builder(identity(credentials)?)
        .build()
        .map_err(|e| tls_error("failed to build TLS acceptor", e))
}
