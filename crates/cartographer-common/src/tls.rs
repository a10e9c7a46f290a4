//! TLS configuration for the admission webhook endpoint
//!
//! The API server only calls webhooks over HTTPS. Certificates are issued
//! outside the operator (usually by cert-manager) and mounted as PEM files.

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Server-side TLS configuration
#[derive(Clone)]
pub struct TlsConfig {
    pub server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Load TLS config from PEM certificate chain and private key files
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        info!(cert = %cert_path.display(), key = %key_path.display(), "Loading TLS certificates");

        let cert_pem = std::fs::read(cert_path)
            .map_err(|e| Error::Tls(format!("Failed to read cert: {}", e)))?;
        let key_pem = std::fs::read(key_path)
            .map_err(|e| Error::Tls(format!("Failed to read key: {}", e)))?;

        let certs = Self::parse_pem_certs(&cert_pem)?;
        let key = Self::parse_pem_key(&key_pem)?;

        Self::from_certs_and_key(certs, key)
    }

    fn parse_pem_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
        let mut reader = BufReader::new(pem);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Tls(format!("Failed to parse certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(Error::Tls("No certificates found".into()));
        }

        Ok(certs)
    }

    fn parse_pem_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
        let mut reader = BufReader::new(pem);
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| Error::Tls(format!("Failed to parse private key: {}", e)))?
            .ok_or_else(|| Error::Tls("No private key found".into()))
    }

    fn from_certs_and_key(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Tls(format!("TLS configuration error: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(server_config),
        })
    }

    /// Get the TLS acceptor for async connections
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

/// Install the process-wide rustls crypto provider.
///
/// Safe to call more than once; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
