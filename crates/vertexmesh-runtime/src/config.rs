//! Worker configuration, loadable from TOML or JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vertexmesh_transport::{
    PoolConfig, SecureTransport, TcpTransportConfig, TlsConfig, TlsSecureTransport,
};

use crate::error::{Result, RuntimeError};
use crate::reconcile::RetryPolicy;
use crate::services::ServiceOptions;

/// Listening address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindAddr {
    /// Interface to bind.
    pub addr: String,
    /// Port to bind; 0 picks a free port.
    pub port: u16,
}

impl BindAddr {
    /// Builds a bind address.
    pub fn new(addr: &str, port: u16) -> Self {
        Self {
            addr: addr.to_string(),
            port,
        }
    }

    /// `"addr:port"` for binding.
    pub fn to_socket_string(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    fn is_unspecified(&self) -> bool {
        matches!(self.addr.as_str(), "0.0.0.0" | "::" | "[::]")
    }
}

impl Default for BindAddr {
    fn default() -> Self {
        Self::new("127.0.0.1", 7400)
    }
}

/// PEM files for the TLS secure-transport hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    /// CA certificate.
    pub ca_cert: PathBuf,
    /// Node certificate chain.
    pub cert_chain: PathBuf,
    /// Node private key.
    pub private_key: PathBuf,
    /// Require peers to present certificates.
    #[serde(default = "default_true")]
    pub require_client_auth: bool,
    /// Name checked against peer certificates instead of the dialed address.
    #[serde(default)]
    pub server_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TlsFiles {
    /// Loads the files and builds the rustls hook.
    pub fn load(&self) -> Result<Arc<dyn SecureTransport>> {
        let mut config = TlsConfig::from_files(
            &self.ca_cert,
            &self.cert_chain,
            &self.private_key,
            self.require_client_auth,
        )?;
        config.server_name = self.server_name.clone();
        Ok(Arc::new(TlsSecureTransport::new(&config)?))
    }
}

/// Configuration of one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Unique instance name.
    pub instance_name: String,
    /// Listening address.
    pub bind: BindAddr,
    /// Address registered for peers; defaults to the bind address.
    pub advertise_addr: Option<String>,
    /// Connection pool bounds.
    pub pool: PoolConfig,
    /// Dialing behaviour.
    pub tcp: TcpTransportConfig,
    /// Reconnect pacing.
    pub retry: RetryPolicy,
    /// JSON metadata store shared with clients.
    pub metadata_path: PathBuf,
    /// Optional TLS material.
    pub tls: Option<TlsFiles>,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance_name: "worker-0".to_string(),
            bind: BindAddr::default(),
            advertise_addr: None,
            pool: PoolConfig::default(),
            tcp: TcpTransportConfig::default(),
            retry: RetryPolicy::default(),
            metadata_path: PathBuf::from("vmesh-metadata.json"),
            tls: None,
            log_level: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Reads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: WorkerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| RuntimeError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(RuntimeError::Config {
                    reason: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(RuntimeError::Config {
                reason: reason.to_string(),
            })
        };
        if self.instance_name.trim().is_empty() {
            return invalid("instance_name must not be empty");
        }
        if self.bind.is_unspecified() && self.advertise_addr.is_none() {
            return invalid("advertise_addr is required when binding a wildcard address");
        }
        if self.pool.max_connections_per_peer == 0 {
            return invalid("pool.max_connections_per_peer must be at least 1");
        }
        if self.retry.backoff_ms == 0 {
            return invalid("retry.backoff_ms must be positive");
        }
        Ok(())
    }

    /// Address peers dial.
    pub fn advertised_address(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.bind.addr)
    }

    /// Service options derived from this configuration, loading TLS
    /// material if configured.
    pub fn service_options(&self) -> Result<ServiceOptions> {
        let secure = match &self.tls {
            Some(files) => Some(files.load()?),
            None => None,
        };
        Ok(ServiceOptions {
            pool: self.pool.clone(),
            tcp: self.tcp.clone(),
            retry: self.retry.clone(),
            secure,
        })
    }
}
