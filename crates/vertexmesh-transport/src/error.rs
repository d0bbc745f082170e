//! Error types for the transport layer.

use thiserror::Error;

/// Errors raised while dialing, framing or securing a transport connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer actively refused the dial.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Address that was dialed.
        addr: String,
    },

    /// The dial did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address that was dialed.
        addr: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The peer closed the stream mid-message.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A frame could not be decoded; the connection is out of sync.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// A length prefix exceeded the configured maximum.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Declared length.
        size: u32,
        /// Maximum accepted length.
        max_size: u32,
    },

    /// The opcode is not part of the control protocol.
    #[error("unknown opcode: {0}")]
    UnknownOpcode(i32),

    /// The reply code is not part of the control protocol.
    #[error("unknown status code: {0}")]
    UnknownStatus(i32),

    /// The liveness probe was answered with a non-zero status or not at all.
    #[error("liveness probe failed for {addr}")]
    ProbeFailed {
        /// Pool key of the probed connection.
        addr: String,
    },

    /// The secure-transport hook rejected or failed the stream.
    #[error("TLS handshake failed: {reason}")]
    TlsError {
        /// Failure detail from rustls.
        reason: String,
    },

    /// Underlying socket error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Builds an [`TransportError::InvalidFrame`] from anything displayable.
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        TransportError::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// True when the error leaves the stream at an unknown position, so the
    /// connection must not be reused.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidFrame { .. }
                | TransportError::PayloadTooLarge { .. }
                | TransportError::UnknownOpcode(_)
                | TransportError::UnknownStatus(_)
        )
    }
}

/// Convenience alias used across the transport crate.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_classification() {
        assert!(TransportError::invalid_frame("short").is_protocol_error());
        assert!(TransportError::UnknownOpcode(99).is_protocol_error());
        assert!(!TransportError::ConnectionReset.is_protocol_error());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(!TransportError::from(io).is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::ConnectionTimeout {
            addr: "10.0.0.1:1500".to_string(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "connection timeout after 250ms to 10.0.0.1:1500");
    }
}
