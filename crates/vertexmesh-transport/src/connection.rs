//! A single transport connection to a peer worker.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Result, TransportError};
use crate::protocol::{read_status, ConnectStatus, ControlRequest};

/// Any duplex byte stream a connection can run over.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream, raw TCP or wrapped by a secure-transport hook.
pub type BoxedStream = Box<dyn TransportStream>;

/// A byte stream plus the peer identity it was opened against.
///
/// Dialed connections carry the address and port they were dialed with, which
/// is also their pool key. Accepted connections carry the peer's socket
/// address.
pub struct Connection {
    stream: BoxedStream,
    address: String,
    port: u16,
    opened_at: Instant,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("age", &self.opened_at.elapsed())
            .finish()
    }
}

impl Connection {
    /// Wraps an established stream.
    pub fn new(stream: BoxedStream, address: impl Into<String>, port: u16) -> Self {
        Self {
            stream,
            address: address.into(),
            port,
            opened_at: Instant::now(),
        }
    }

    /// Host part of the peer identity.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Port part of the peer identity.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `"address:port"`, the key used by the connection pool.
    pub fn pool_key(&self) -> String {
        pool_key(&self.address, self.port)
    }

    /// Time since the stream was established.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Replaces the underlying stream, used by the secure-transport hook.
    pub fn map_stream<F>(self, f: F) -> Self
    where
        F: FnOnce(BoxedStream) -> BoxedStream,
    {
        Self {
            stream: f(self.stream),
            ..self
        }
    }

    /// Splits off the raw stream.
    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }

    /// Sends `PING` and requires a `Success` reply within `timeout`.
    pub async fn ping(&mut self, timeout: Duration) -> Result<()> {
        let key = self.pool_key();
        let probe = async {
            ControlRequest::Ping.write_to(&mut *self).await?;
            read_status(&mut *self).await
        };
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(ConnectStatus::Success)) => Ok(()),
            Ok(Ok(status)) => {
                tracing::debug!(addr = %key, %status, "probe answered with non-zero status");
                Err(TransportError::ProbeFailed { addr: key })
            }
            Ok(Err(e)) => {
                tracing::debug!(addr = %key, error = %e, "probe failed");
                Err(TransportError::ProbeFailed { addr: key })
            }
            Err(_) => Err(TransportError::ProbeFailed { addr: key }),
        }
    }
}

/// Builds the pool key for an address and port.
pub fn pool_key(address: &str, port: u16) -> String {
    format!("{}:{}", address, port)
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{write_status, Opcode};

    #[test]
    fn test_pool_key_format() {
        assert_eq!(pool_key("10.1.2.3", 1500), "10.1.2.3:1500");
    }

    #[tokio::test]
    async fn test_ping_success() {
        let (a, mut b) = tokio::io::duplex(256);
        let mut conn = Connection::new(Box::new(a), "peer", 1);
        let responder = tokio::spawn(async move {
            let op = crate::codec::read_i32(&mut b).await.unwrap();
            assert_eq!(op, Opcode::Ping as i32);
            write_status(&mut b, ConnectStatus::Success).await.unwrap();
            b
        });
        conn.ping(Duration::from_secs(1)).await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_non_zero_status_fails() {
        let (a, mut b) = tokio::io::duplex(256);
        let mut conn = Connection::new(Box::new(a), "peer", 1);
        let responder = tokio::spawn(async move {
            let _ = crate::codec::read_i32(&mut b).await.unwrap();
            write_status(&mut b, ConnectStatus::ServerRecovering)
                .await
                .unwrap();
            b
        });
        let err = conn.ping(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::ProbeFailed { .. }));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_silent_peer_times_out() {
        let (a, _b) = tokio::io::duplex(256);
        let mut conn = Connection::new(Box::new(a), "peer", 1);
        let err = conn.ping(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, TransportError::ProbeFailed { .. }));
    }
}
