//! Plain TCP dialing and accepting between workers.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};

use crate::connection::Connection;
use crate::error::{Result, TransportError};

/// Dialing behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpTransportConfig {
    /// Dial timeout in milliseconds (default: 5000).
    pub connect_timeout_ms: u64,
    /// Set `TCP_NODELAY` on dialed and accepted sockets (default: true).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// TCP transport: dials and accepts connections.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Transport using `config`.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Dials `address:port`. The returned connection is keyed by the same pair.
    pub async fn connect(&self, address: &str, port: u16) -> Result<Connection> {
        let addr = format!("{}:{}", address, port);
        let timeout = std::time::Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.clone(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| match e.kind() {
                io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: addr.clone(),
                },
                _ => TransportError::IoError(e),
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        tracing::debug!(addr = %addr, "dialed peer");
        Ok(Connection::new(Box::new(stream), address, port))
    }

    /// Binds a listener on `addr`.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(TransportError::IoError)
    }

    /// Waits for the next peer on `listener`, keyed by its address.
    pub async fn accept(&self, listener: &TcpListener) -> Result<Connection> {
        let (stream, peer) = listener.accept().await.map_err(TransportError::IoError)?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        Ok(Connection::new(
            Box::new(stream),
            peer.ip().to_string(),
            peer.port(),
        ))
    }
}
