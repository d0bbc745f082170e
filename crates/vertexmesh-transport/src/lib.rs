#![warn(missing_docs)]

//! VertexMesh transport subsystem: varint wire codec, control protocol, TCP
//! dialing, secure-transport hook and pooled connections between workers.

pub mod codec;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod secure;
pub mod tcp;

pub use connection::{pool_key, BoxedStream, Connection, TransportStream};
pub use error::{Result, TransportError};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use protocol::{ConnectStatus, ConnectionKey, ControlRequest, Direction, Opcode};
pub use secure::{SecureTransport, TlsConfig, TlsSecureTransport};
pub use tcp::{TcpTransport, TcpTransportConfig};
