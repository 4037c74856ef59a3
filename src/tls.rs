//! TLS Listener Support
//!
//! Builds the rustls server configuration from the `ssl.*` settings. When
//! `verify_peer` is set, client certificates are required and validated
//! against the server's own certificate chain; `allow_self_signed`
//! downgrades that to no client verification.

use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::{self, pki_types, RootCertStore};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::SslConfig;
use crate::error::{BrokerError, Result};

/// Loads PEM certificates from a file path.
fn load_certs(path: &str) -> Result<Vec<pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| BrokerError::Config(format!("failed to open cert file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| BrokerError::Config(format!("failed to parse certs from {}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(BrokerError::Config(format!(
            "no certificates found in {}",
            path
        )));
    }
    Ok(certs)
}

/// Loads a PEM private key (PKCS#8, RSA, or EC) from a file path.
fn load_private_key(path: &str) -> Result<pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| BrokerError::Config(format!("failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| BrokerError::Config(format!("failed to parse key from {}: {}", path, e)))?
        .ok_or_else(|| BrokerError::Config(format!("no private key found in {}", path)))
}

/// Builds the TLS acceptor for the WebSocket listener, or `None` when TLS
/// is not configured.
pub fn acceptor(ssl: &SslConfig) -> Result<Option<TlsAcceptor>> {
    if !ssl.enabled() {
        return Ok(None);
    }
    let cert_path = ssl.local_cert.as_deref().unwrap_or_default();
    let key_path = ssl.local_pk.as_deref().unwrap_or_default();

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = if ssl.verify_peer && !ssl.allow_self_signed {
        let mut roots = RootCertStore::empty();
        for cert in &certs {
            roots.add(cert.clone()).map_err(|e| {
                BrokerError::Config(format!("failed to build client trust store: {}", e))
            })?;
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| {
                BrokerError::Config(format!("failed to build client verifier: {}", e))
            })?;
        rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        if ssl.verify_peer {
            warn!("verify_peer requested with allow_self_signed; client certificates are not verified");
        }
        rustls::ServerConfig::builder().with_no_client_auth()
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| BrokerError::Config(format!("invalid certificate or key: {}", e)))?;

    info!(cert = %cert_path, "tls enabled");
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
