//! Pluggable secure-transport hook.
//!
//! A [`SecureTransport`] wraps a freshly dialed or accepted stream before any
//! opcode crosses it. Workers without a hook use raw streams.
//! [`TlsSecureTransport`] is the rustls-backed implementation, optionally
//! mutual.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};

use crate::connection::{BoxedStream, Connection};
use crate::error::{Result, TransportError};

/// Wraps raw streams before they carry protocol traffic.
#[async_trait]
pub trait SecureTransport: Send + Sync + 'static {
    /// Wraps a stream this process dialed towards `remote_instance` at `address`.
    async fn wrap_outbound(
        &self,
        stream: BoxedStream,
        remote_instance: &str,
        address: &str,
    ) -> Result<BoxedStream>;

    /// Wraps a stream this process accepted from `peer_addr`.
    async fn wrap_inbound(&self, stream: BoxedStream, peer_addr: &str) -> Result<BoxedStream>;
}

/// Applies `hook` to a freshly dialed connection, if there is one.
pub async fn secure_outbound(
    hook: Option<&Arc<dyn SecureTransport>>,
    conn: Connection,
    remote_instance: &str,
) -> Result<Connection> {
    let Some(hook) = hook else {
        return Ok(conn);
    };
    let address = conn.address().to_string();
    let port = conn.port();
    let stream = hook
        .wrap_outbound(conn.into_stream(), remote_instance, &address)
        .await?;
    Ok(Connection::new(stream, address, port))
}

/// Applies `hook` to a freshly accepted connection, if there is one.
pub async fn secure_inbound(
    hook: Option<&Arc<dyn SecureTransport>>,
    conn: Connection,
) -> Result<Connection> {
    let Some(hook) = hook else {
        return Ok(conn);
    };
    let address = conn.address().to_string();
    let port = conn.port();
    let peer = conn.pool_key();
    let stream = hook.wrap_inbound(conn.into_stream(), &peer).await?;
    Ok(Connection::new(stream, address, port))
}

/// PEM material for [`TlsSecureTransport`].
#[derive(Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM-encoded CA certificate for verifying peer certificates.
    pub ca_cert_pem: Vec<u8>,
    /// PEM-encoded certificate chain (node cert + intermediates).
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded private key for this node.
    pub private_key_pem: Vec<u8>,
    /// Whether to require client certificates (true for mTLS).
    pub require_client_auth: bool,
    /// Overrides the server name checked on outbound dials. Defaults to the
    /// dialed address.
    pub server_name: Option<String>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("require_client_auth", &self.require_client_auth)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Loads the three PEM files from disk.
    pub fn from_files(
        ca_cert: &std::path::Path,
        cert_chain: &std::path::Path,
        private_key: &std::path::Path,
        require_client_auth: bool,
    ) -> Result<Self> {
        Ok(Self {
            ca_cert_pem: std::fs::read(ca_cert)?,
            cert_chain_pem: std::fs::read(cert_chain)?,
            private_key_pem: std::fs::read(private_key)?,
            require_client_auth,
            server_name: None,
        })
    }
}

fn tls_error(context: &str, e: impl fmt::Display) -> TransportError {
    TransportError::TlsError {
        reason: format!("{}: {}", context, e),
    }
}

/// rustls-backed secure transport.
pub struct TlsSecureTransport {
    connector: tokio_rustls::TlsConnector,
    acceptor: tokio_rustls::TlsAcceptor,
    server_name: Option<String>,
}

impl fmt::Debug for TlsSecureTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSecureTransport")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsSecureTransport {
    /// Builds client and server configurations from `config`.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;

        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs_from_pem(&config.ca_cert_pem)? {
            roots
                .add(cert)
                .map_err(|e| tls_error("failed to add CA cert", e))?;
        }
        let roots = Arc::new(roots);

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(certs.clone(), key.clone_key())
            .map_err(|e| tls_error("failed to create client config", e))?;

        let server_builder = if config.require_client_auth {
            let verifier = rustls::server::WebPkiClientVerifier::builder(roots)
                .build()
                .map_err(|e| tls_error("failed to build client verifier", e))?;
            rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            rustls::ServerConfig::builder().with_no_client_auth()
        };
        let server_config = server_builder
            .with_single_cert(certs, key)
            .map_err(|e| tls_error("failed to set server cert", e))?;

        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
            acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
            server_name: config.server_name.clone(),
        })
    }

    fn server_name_for(&self, address: &str) -> Result<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(address);
        if let Ok(ip) = name.parse::<std::net::IpAddr>() {
            return Ok(ServerName::IpAddress(ip.into()));
        }
        ServerName::try_from(name.to_string()).map_err(|e| tls_error("invalid server name", e))
    }
}

#[async_trait]
impl SecureTransport for TlsSecureTransport {
    async fn wrap_outbound(
        &self,
        stream: BoxedStream,
        remote_instance: &str,
        address: &str,
    ) -> Result<BoxedStream> {
        let domain = self.server_name_for(address)?;
        let tls = self
            .connector
            .connect(domain, stream)
            .await
            .map_err(|e| tls_error("TLS connect failed", e))?;
        tracing::debug!(instance = remote_instance, addr = address, "TLS session established");
        Ok(Box::new(tls))
    }

    async fn wrap_inbound(&self, stream: BoxedStream, peer_addr: &str) -> Result<BoxedStream> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| tls_error("TLS accept failed", e))?;
        tracing::debug!(peer = peer_addr, "TLS session accepted");
        Ok(Box::new(tls))
    }
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut cursor)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| tls_error("malformed certificate PEM", e))?;
    if certs.is_empty() {
        return Err(TransportError::TlsError {
            reason: "no certificates found in PEM".to_string(),
        });
    }
    Ok(certs)
}

/// Loads a private key (PKCS#8, PKCS#1 or SEC1) from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| tls_error("malformed key PEM", e))?
        .ok_or_else(|| TransportError::TlsError {
            reason: "no private key found in PEM".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    struct Pems {
        ca: Vec<u8>,
        cert: Vec<u8>,
        key: Vec<u8>,
    }

    fn generate(node_name: &str) -> Pems {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::default();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let node_key = rcgen::KeyPair::generate().unwrap();
        let node_params = rcgen::CertificateParams::new(vec![node_name.to_string()]).unwrap();
        let node_cert = node_params.signed_by(&node_key, &ca_cert, &ca_key).unwrap();

        Pems {
            ca: ca_cert.pem().into_bytes(),
            cert: node_cert.pem().into_bytes(),
            key: node_key.serialize_pem().into_bytes(),
        }
    }

    fn config(pems: &Pems, mutual: bool) -> TlsConfig {
        TlsConfig {
            ca_cert_pem: pems.ca.clone(),
            cert_chain_pem: pems.cert.clone(),
            private_key_pem: pems.key.clone(),
            require_client_auth: mutual,
            server_name: Some("worker.local".to_string()),
        }
    }

    #[test]
    fn test_load_pem_material() {
        let pems = generate("worker.local");
        assert_eq!(load_certs_from_pem(&pems.cert).unwrap().len(), 1);
        assert!(!load_private_key_from_pem(&pems.key)
            .unwrap()
            .secret_der()
            .is_empty());
        assert!(load_certs_from_pem(b"not pem").is_err());
        assert!(load_private_key_from_pem(b"").is_err());
    }

    #[tokio::test]
    async fn test_mutual_tls_round_trip() {
        let pems = generate("worker.local");
        let hook = Arc::new(TlsSecureTransport::new(&config(&pems, true)).unwrap());
        let (a, b) = tokio::io::duplex(16 * 1024);

        let server_hook = hook.clone();
        let server = tokio::spawn(async move {
            let mut stream = server_hook
                .wrap_inbound(Box::new(b), "127.0.0.1:1")
                .await
                .unwrap();
            let msg = codec::read_string(&mut stream).await.unwrap();
            codec::write_string(&mut stream, &format!("ack {}", msg))
                .await
                .unwrap();
        });

        let mut stream = hook
            .wrap_outbound(Box::new(a), "w2", "127.0.0.1")
            .await
            .unwrap();
        codec::write_string(&mut stream, "hello").await.unwrap();
        assert_eq!(codec::read_string(&mut stream).await.unwrap(), "ack hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_absent_hook_keeps_raw_stream() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = Connection::new(Box::new(a), "10.0.0.9", 1500);
        let conn = secure_outbound(None, conn, "w9").await.unwrap();
        assert_eq!(conn.pool_key(), "10.0.0.9:1500");
    }
}
