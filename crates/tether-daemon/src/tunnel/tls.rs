//! Mutual-TLS client setup for the rendezvous connection

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use tether_core::error::TunnelError;
use tether_core::TlsBundle;

fn invalid(what: &str, e: impl std::fmt::Display) -> TunnelError {
    TunnelError::InvalidCredentials(format!("{}: {}", what, e))
}

/// Build a rustls client config that trusts the bundle's CA and presents
/// the bundle's certificate
pub fn client_config(bundle: &TlsBundle) -> Result<Arc<ClientConfig>, TunnelError> {
    let mut roots = RootCertStore::empty();
    let mut ca = bundle.ca_pem();
    for cert in rustls_pemfile::certs(&mut ca) {
        let cert = cert.map_err(|e| invalid("ca", e))?;
        roots.add(cert).map_err(|e| invalid("ca", e))?;
    }

    let mut chain = bundle.cert_pem();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut chain)
        .collect::<Result<_, _>>()
        .map_err(|e| invalid("certificate", e))?;

    let mut key = bundle.key_pem();
    let key = rustls_pemfile::private_key(&mut key)
        .map_err(|e| invalid("key", e))?
        .ok_or_else(|| TunnelError::InvalidCredentials("key: no private key found".to_string()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| invalid("protocol versions", e))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| invalid("client certificate", e))?;

    Ok(Arc::new(config))
}

/// Connector plus the server name to verify against
pub fn connector(bundle: &TlsBundle, host: &str) -> Result<(TlsConnector, ServerName<'static>), TunnelError> {
    let config = client_config(bundle)?;
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| TunnelError::InvalidServer(host.to_string()))?;
    Ok((TlsConnector::from(config), name))
}
