//! Control-plane protocol spoken between clients and workers.
//!
//! Every request is an opcode followed by the opcode's fixed field sequence;
//! every reply is a single status code. Both are encoded with the varint
//! primitives in [`crate::codec`].

use std::fmt;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, encode_bytes, encode_i32, encode_string};
use crate::error::{Result, TransportError};

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    /// Instantiate a vertex on the receiving worker.
    LoadVertex = 0,
    /// Client asks the worker hosting the from-vertex to drive a connection.
    ConnectInitiator = 1,
    /// Worker asks the worker hosting the to-vertex to accept a connection.
    ConnectReceiver = 2,
    /// Client asks the worker hosting the to-vertex to drive a connection.
    ConnectInitiatorReverse = 3,
    /// Worker asks the worker hosting the from-vertex to accept a connection.
    ConnectReceiverReverse = 4,
    /// Liveness probe, answered with a bare status.
    Ping = 5,
    /// Tear down any live pump for a connection key.
    Disconnect = 6,
}

impl TryFrom<i32> for Opcode {
    type Error = TransportError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => Opcode::LoadVertex,
            1 => Opcode::ConnectInitiator,
            2 => Opcode::ConnectReceiver,
            3 => Opcode::ConnectInitiatorReverse,
            4 => Opcode::ConnectReceiverReverse,
            5 => Opcode::Ping,
            6 => Opcode::Disconnect,
            other => return Err(TransportError::UnknownOpcode(other)),
        })
    }
}

/// Status returned for every control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ConnectStatus {
    /// The request completed.
    Success = 0,
    /// The vertex is not hosted where it was expected.
    VertexNotFound = 1,
    /// The vertex exists but lacks the named input or output endpoint.
    VertexEndpointNotFound = 2,
    /// No transport connection could be opened or the reply was lost.
    ConnectionEstablishFailed = 3,
    /// Another attempt registered the same key first.
    ConnectionAdditionRace = 4,
    /// The receiver already holds a live pump for the key.
    ServerRecovering = 5,
    /// The vertex definition is unknown or its initialization failed.
    VertexLoadFailed = 6,
}

impl ConnectStatus {
    /// Wire value of the status.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// True for [`ConnectStatus::Success`].
    pub fn is_success(self) -> bool {
        self == ConnectStatus::Success
    }

    /// True for statuses expected under concurrent reconnection.
    pub fn is_contention(self) -> bool {
        matches!(
            self,
            ConnectStatus::ConnectionAdditionRace | ConnectStatus::ServerRecovering
        )
    }
}

impl TryFrom<i32> for ConnectStatus {
    type Error = TransportError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => ConnectStatus::Success,
            1 => ConnectStatus::VertexNotFound,
            2 => ConnectStatus::VertexEndpointNotFound,
            3 => ConnectStatus::ConnectionEstablishFailed,
            4 => ConnectStatus::ConnectionAdditionRace,
            5 => ConnectStatus::ServerRecovering,
            6 => ConnectStatus::VertexLoadFailed,
            other => return Err(TransportError::UnknownStatus(other)),
        })
    }
}

impl fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identity of a logical connection between two endpoints.
///
/// Data always flows from `from_endpoint` to `to_endpoint`, whichever side
/// dialed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    /// Vertex owning the output endpoint.
    pub from_vertex: String,
    /// Output endpoint name.
    pub from_endpoint: String,
    /// Vertex owning the input endpoint.
    pub to_vertex: String,
    /// Input endpoint name.
    pub to_endpoint: String,
}

impl ConnectionKey {
    /// Builds a key from its four parts.
    pub fn new(
        from_vertex: impl Into<String>,
        from_endpoint: impl Into<String>,
        to_vertex: impl Into<String>,
        to_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            from_vertex: from_vertex.into(),
            from_endpoint: from_endpoint.into(),
            to_vertex: to_vertex.into(),
            to_endpoint: to_endpoint.into(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        encode_string(&self.from_vertex, buf)?;
        encode_string(&self.from_endpoint, buf)?;
        encode_string(&self.to_vertex, buf)?;
        encode_string(&self.to_endpoint, buf)
    }

    async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let from_vertex = codec::read_string(reader).await?;
        let from_endpoint = codec::read_string(reader).await?;
        let to_vertex = codec::read_string(reader).await?;
        let to_endpoint = codec::read_string(reader).await?;
        Ok(Self {
            from_vertex,
            from_endpoint,
            to_vertex,
            to_endpoint,
        })
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.from_vertex, self.from_endpoint, self.to_vertex, self.to_endpoint
        )
    }
}

/// Which side of a connection drives the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    /// The from-vertex's worker dials the to-vertex's worker.
    #[default]
    Forward,
    /// The to-vertex's worker dials the from-vertex's worker.
    Reverse,
}

impl Direction {
    /// The opposite direction.
    pub fn flip(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// A decoded control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Instantiate `definition` as `vertex_name` with an opaque parameter.
    LoadVertex {
        /// Name the vertex will be registered under.
        vertex_name: String,
        /// Name of the vertex definition known to the worker.
        definition: String,
        /// Serialized construction parameter.
        parameter: Vec<u8>,
    },
    /// Client-to-worker: drive a connection from this worker.
    ConnectInitiator {
        /// Connection to establish.
        key: ConnectionKey,
        /// Whether the receiving worker hosts the to side (forward) or the from side.
        direction: Direction,
    },
    /// Worker-to-worker: accept a connection driven by the peer.
    ConnectReceiver {
        /// Connection to establish.
        key: ConnectionKey,
        /// Forward when the receiver hosts the to-vertex.
        direction: Direction,
        /// Cancel an existing live pump for the key instead of refusing.
        kill_if_exists: bool,
    },
    /// Liveness probe.
    Ping,
    /// Cancel every live pump for `key` on the receiving worker.
    Disconnect {
        /// Connection to tear down.
        key: ConnectionKey,
    },
}

impl ControlRequest {
    /// Opcode that introduces this request on the wire.
    pub fn opcode(&self) -> Opcode {
        match self {
            ControlRequest::LoadVertex { .. } => Opcode::LoadVertex,
            ControlRequest::ConnectInitiator {
                direction: Direction::Forward,
                ..
            } => Opcode::ConnectInitiator,
            ControlRequest::ConnectInitiator {
                direction: Direction::Reverse,
                ..
            } => Opcode::ConnectInitiatorReverse,
            ControlRequest::ConnectReceiver {
                direction: Direction::Forward,
                ..
            } => Opcode::ConnectReceiver,
            ControlRequest::ConnectReceiver {
                direction: Direction::Reverse,
                ..
            } => Opcode::ConnectReceiverReverse,
            ControlRequest::Ping => Opcode::Ping,
            ControlRequest::Disconnect { .. } => Opcode::Disconnect,
        }
    }

    /// Appends the full wire form of the request to `buf`.
    ///
    /// Fails with `PayloadTooLarge` when a field exceeds the frame limit;
    /// `buf` may then hold a partial request and must be discarded.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        encode_i32(self.opcode() as i32, buf);
        match self {
            ControlRequest::LoadVertex {
                vertex_name,
                definition,
                parameter,
            } => {
                encode_string(vertex_name, buf)?;
                encode_string(definition, buf)?;
                encode_bytes(parameter, buf)?;
            }
            ControlRequest::ConnectInitiator { key, .. } => key.encode(buf)?,
            ControlRequest::ConnectReceiver {
                key,
                kill_if_exists,
                ..
            } => {
                key.encode(buf)?;
                encode_i32(i32::from(*kill_if_exists), buf);
            }
            ControlRequest::Ping => {}
            ControlRequest::Disconnect { key } => key.encode(buf)?,
        }
        Ok(())
    }

    /// Writes the request in one buffer and flushes it.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads the fields that follow an already consumed opcode.
    pub async fn read_body<R>(opcode: Opcode, reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        Ok(match opcode {
            Opcode::LoadVertex => {
                let vertex_name = codec::read_string(reader).await?;
                let definition = codec::read_string(reader).await?;
                let parameter = codec::read_bytes(reader).await?;
                ControlRequest::LoadVertex {
                    vertex_name,
                    definition,
                    parameter,
                }
            }
            Opcode::ConnectInitiator | Opcode::ConnectInitiatorReverse => {
                let key = ConnectionKey::read_from(reader).await?;
                let direction = if opcode == Opcode::ConnectInitiator {
                    Direction::Forward
                } else {
                    Direction::Reverse
                };
                ControlRequest::ConnectInitiator { key, direction }
            }
            Opcode::ConnectReceiver | Opcode::ConnectReceiverReverse => {
                let key = ConnectionKey::read_from(reader).await?;
                let kill_if_exists = match codec::read_i32(reader).await? {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(TransportError::invalid_frame(format!(
                            "kill flag must be 0 or 1, got {}",
                            other
                        )))
                    }
                };
                let direction = if opcode == Opcode::ConnectReceiver {
                    Direction::Forward
                } else {
                    Direction::Reverse
                };
                ControlRequest::ConnectReceiver {
                    key,
                    direction,
                    kill_if_exists,
                }
            }
            Opcode::Ping => ControlRequest::Ping,
            Opcode::Disconnect => ControlRequest::Disconnect {
                key: ConnectionKey::read_from(reader).await?,
            },
        })
    }

    /// Reads a complete request, opcode first.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let opcode = Opcode::try_from(codec::read_i32(reader).await?)?;
        Self::read_body(opcode, reader).await
    }
}

/// Writes a reply status.
pub async fn write_status<W>(writer: &mut W, status: ConnectStatus) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    codec::write_i32(writer, status.code()).await
}

/// Reads a reply status.
pub async fn read_status<R>(reader: &mut R) -> Result<ConnectStatus>
where
    R: AsyncRead + Unpin + ?Sized,
{
    ConnectStatus::try_from(codec::read_i32(reader).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConnectionKey {
        ConnectionKey::new("a", "out1", "b", "in1")
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::LoadVertex as i32, 0);
        assert_eq!(Opcode::Ping as i32, 5);
        assert_eq!(Opcode::try_from(4).unwrap(), Opcode::ConnectReceiverReverse);
        assert!(matches!(
            Opcode::try_from(42),
            Err(TransportError::UnknownOpcode(42))
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ConnectStatus::Success.code(), 0);
        assert!(ConnectStatus::ServerRecovering.is_contention());
        assert!(ConnectStatus::ConnectionAdditionRace.is_contention());
        assert!(!ConnectStatus::VertexNotFound.is_contention());
        for code in 0..=6 {
            assert_eq!(ConnectStatus::try_from(code).unwrap().code(), code);
        }
        assert!(ConnectStatus::try_from(-1).is_err());
    }

    #[test]
    fn test_reverse_opcodes_selected_by_direction() {
        let forward = ControlRequest::ConnectReceiver {
            key: key(),
            direction: Direction::Forward,
            kill_if_exists: false,
        };
        let reverse = ControlRequest::ConnectInitiator {
            key: key(),
            direction: Direction::Reverse,
        };
        assert_eq!(forward.opcode(), Opcode::ConnectReceiver);
        assert_eq!(reverse.opcode(), Opcode::ConnectInitiatorReverse);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key().to_string(), "a:out1 -> b:in1");
    }

    #[tokio::test]
    async fn test_requests_cross_a_stream() {
        let requests = vec![
            ControlRequest::Ping,
            ControlRequest::LoadVertex {
                vertex_name: "a".into(),
                definition: "counter".into(),
                parameter: vec![],
            },
            ControlRequest::ConnectReceiver {
                key: key(),
                direction: Direction::Reverse,
                kill_if_exists: true,
            },
            ControlRequest::Disconnect { key: key() },
        ];
        let (mut a, mut b) = tokio::io::duplex(4096);
        for request in &requests {
            request.write_to(&mut a).await.unwrap();
        }
        for request in &requests {
            assert_eq!(&ControlRequest::read_from(&mut b).await.unwrap(), request);
        }
    }

    #[tokio::test]
    async fn test_oversized_parameter_never_reaches_the_wire() {
        let request = ControlRequest::LoadVertex {
            vertex_name: "big".to_string(),
            definition: "blob".to_string(),
            parameter: vec![0u8; codec::MAX_PAYLOAD_SIZE as usize + 1],
        };
        let mut out: Vec<u8> = Vec::new();
        let err = request.write_to(&mut out).await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { .. }));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_bad_kill_flag_is_protocol_error() {
        let mut buf = BytesMut::new();
        encode_i32(Opcode::ConnectReceiver as i32, &mut buf);
        key().encode(&mut buf).unwrap();
        encode_i32(7, &mut buf);
        let mut slice = &buf[..];
        let err = ControlRequest::read_from(&mut slice).await.unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_status_round_trip_on_stream() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_status(&mut a, ConnectStatus::ServerRecovering).await.unwrap();
        assert_eq!(read_status(&mut b).await.unwrap(), ConnectStatus::ServerRecovering);
    }
}
