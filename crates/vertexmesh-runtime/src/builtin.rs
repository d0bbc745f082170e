//! Built-in vertex definitions shipped with the `vmesh` binary.
//!
//! All of them speak the same record stream: a varint record count followed
//! by that many length-prefixed byte arrays. The count makes every transfer
//! self-delimiting, so a finished connection can go back to the pool.
//!
//! | definition | endpoints | parameter |
//! |------------|-----------|-----------|
//! | `counter`  | fusable async output `out` | record count, decimal (default 10) |
//! | `echo`     | async input `in` | unused |
//! | `blob`     | sync output `out` | bytes sent as one record |
//! | `tally`    | sync input `in` | unused |

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;
use vertexmesh_transport::codec;

use crate::endpoint::{
    pipe_into, AsyncInputEndpoint, AsyncOutputEndpoint, EndpointSet, FusableOutputEndpoint,
    InputEndpoint, SyncInputEndpoint, SyncOutputEndpoint,
};
use crate::error::{Result, RuntimeError};
use crate::vertex::{Vertex, VertexCatalog};

const DEFAULT_COUNT: u32 = 10;

fn io_err(e: vertexmesh_transport::TransportError) -> io::Error {
    io::Error::other(e)
}

/// Writes `records` in record-stream form.
pub async fn write_records<W>(stream: &mut W, records: &[Vec<u8>]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let count = i32::try_from(records.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many records"))?;
    codec::write_i32(stream, count).await.map_err(io_err)?;
    for record in records {
        codec::write_bytes(stream, record).await.map_err(io_err)?;
    }
    Ok(())
}

/// Reads one record stream, calling `each` per record.
pub async fn read_records<R>(
    stream: &mut R,
    token: &CancellationToken,
    mut each: impl FnMut(Vec<u8>) + Send,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let count = codec::read_i32(stream).await.map_err(io_err)?;
    if count < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "negative record count"));
    }
    let mut seen = 0;
    for _ in 0..count {
        if token.is_cancelled() {
            break;
        }
        each(codec::read_bytes(stream).await.map_err(io_err)?);
        seen += 1;
    }
    Ok(seen)
}

/// Fusable output emitting the decimal strings `0..count`.
#[derive(Debug, Clone)]
pub struct CounterOutput {
    vertex: String,
    count: u32,
}

impl CounterOutput {
    fn records(&self) -> Vec<Vec<u8>> {
        (0..self.count).map(|n| n.to_string().into_bytes()).collect()
    }
}

#[async_trait]
impl AsyncOutputEndpoint for CounterOutput {
    async fn to_stream(
        &self,
        stream: &mut (dyn AsyncWrite + Unpin + Send),
        _other_vertex: &str,
        _other_endpoint: &str,
        _token: CancellationToken,
    ) -> io::Result<()> {
        write_records(stream, &self.records()).await
    }
}

#[async_trait]
impl FusableOutputEndpoint for CounterOutput {
    fn can_fuse_with(
        &self,
        _input: &InputEndpoint,
        _other_vertex: &str,
        _other_endpoint: &str,
    ) -> bool {
        true
    }

    async fn to_input(
        &self,
        input: &InputEndpoint,
        other_vertex: &str,
        other_endpoint: &str,
        token: CancellationToken,
    ) -> io::Result<()> {
        let from = (self.vertex.as_str(), "out");
        pipe_into(self, input, from, (other_vertex, other_endpoint), token).await
    }
}

struct Counter;

impl Vertex for Counter {
    fn initialize(&mut self, parameter: &[u8], endpoints: &mut EndpointSet) -> Result<()> {
        let count = if parameter.is_empty() {
            DEFAULT_COUNT
        } else {
            std::str::from_utf8(parameter)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| RuntimeError::Config {
                    reason: "counter parameter must be a decimal count".to_string(),
                })?
        };
        let vertex = endpoints.vertex_name().to_string();
        endpoints.add_fusable_output("out", CounterOutput { vertex, count })
    }
}

/// Async input that logs every record it receives.
#[derive(Debug, Clone, Default)]
pub struct EchoInput {
    received: Arc<AtomicU64>,
}

impl EchoInput {
    /// Records received so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AsyncInputEndpoint for EchoInput {
    async fn from_stream(
        &self,
        stream: &mut (dyn AsyncRead + Unpin + Send),
        other_vertex: &str,
        other_endpoint: &str,
        token: CancellationToken,
    ) -> io::Result<()> {
        let received = self.received.clone();
        let seen = read_records(stream, &token, |record| {
            received.fetch_add(1, Ordering::Relaxed);
            info!(from = %other_vertex, endpoint = %other_endpoint, record = %String::from_utf8_lossy(&record), "echo");
        })
        .await?;
        info!(from = %other_vertex, endpoint = %other_endpoint, records = seen, "echo stream finished");
        Ok(())
    }
}

struct Echo;

impl Vertex for Echo {
    fn initialize(&mut self, _parameter: &[u8], endpoints: &mut EndpointSet) -> Result<()> {
        endpoints.add_async_input("in", EchoInput::default())
    }
}

/// Blocking output sending a fixed payload as one record.
#[derive(Debug, Clone)]
pub struct BlobOutput {
    payload: Vec<u8>,
}

impl SyncOutputEndpoint for BlobOutput {
    fn to_stream(
        &self,
        stream: &mut dyn Write,
        _other_vertex: &str,
        _other_endpoint: &str,
        _token: &CancellationToken,
    ) -> io::Result<()> {
        codec::write_i32_blocking(stream, 1).map_err(io_err)?;
        codec::write_bytes_blocking(stream, &self.payload).map_err(io_err)
    }
}

struct Blob;

impl Vertex for Blob {
    fn initialize(&mut self, parameter: &[u8], endpoints: &mut EndpointSet) -> Result<()> {
        if parameter.len() > codec::MAX_PAYLOAD_SIZE as usize {
            return Err(RuntimeError::Config {
                reason: format!(
                    "blob payload of {} bytes exceeds the {} byte record limit",
                    parameter.len(),
                    codec::MAX_PAYLOAD_SIZE
                ),
            });
        }
        endpoints.add_sync_output(
            "out",
            BlobOutput {
                payload: parameter.to_vec(),
            },
        )
    }
}

/// Blocking input counting received records and bytes.
#[derive(Debug, Clone, Default)]
pub struct TallyInput {
    records: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
}

impl TallyInput {
    /// Records and bytes received so far.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.records.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

impl SyncInputEndpoint for TallyInput {
    fn from_stream(
        &self,
        stream: &mut dyn Read,
        other_vertex: &str,
        _other_endpoint: &str,
        token: &CancellationToken,
    ) -> io::Result<()> {
        let count = codec::read_i32_blocking(stream).map_err(io_err)?;
        for _ in 0..count.max(0) {
            if token.is_cancelled() {
                break;
            }
            let record = codec::read_bytes_blocking(stream).map_err(io_err)?;
            self.records.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(record.len() as u64, Ordering::Relaxed);
        }
        let (records, bytes) = self.totals();
        info!(from = %other_vertex, records, bytes, "tally updated");
        Ok(())
    }
}

struct Tally;

impl Vertex for Tally {
    fn initialize(&mut self, _parameter: &[u8], endpoints: &mut EndpointSet) -> Result<()> {
        endpoints.add_sync_input("in", TallyInput::default())
    }
}

/// Catalog with every built-in definition.
pub fn catalog() -> VertexCatalog {
    let mut catalog = VertexCatalog::new();
    catalog
        .register("counter", || Counter)
        .register("echo", || Echo)
        .register("blob", || Blob)
        .register("tally", || Tally);
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::OutputEndpoint;

    #[test]
    fn test_catalog_definitions() {
        assert_eq!(catalog().definitions(), vec!["blob", "counter", "echo", "tally"]);
    }

    #[test]
    fn test_counter_parameter_parsing() {
        let mut set = EndpointSet::new("c");
        Counter.initialize(b"3", &mut set).unwrap();
        assert!(set.output("out").unwrap().as_fusable().is_some());

        let mut set = EndpointSet::new("c");
        assert!(Counter.initialize(b"three", &mut set).is_err());
    }

    #[test]
    fn test_blob_rejects_payload_over_record_limit() {
        let limit = codec::MAX_PAYLOAD_SIZE as usize;
        let mut set = EndpointSet::new("b");
        Blob.initialize(&vec![1u8; limit], &mut set).unwrap();

        let mut set = EndpointSet::new("b");
        let err = Blob.initialize(&vec![1u8; limit + 1], &mut set).unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));
        assert!(set.output("out").is_none());
    }

    #[tokio::test]
    async fn test_counter_fuses_into_echo() {
        let echo = EchoInput::default();
        let input = InputEndpoint::Async(Arc::new(echo.clone()));
        let counter = CounterOutput {
            vertex: "c".to_string(),
            count: 5,
        };
        assert!(counter.can_fuse_with(&input, "e", "in"));
        counter
            .to_input(&input, "e", "in", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(echo.received(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blob_into_tally_over_duplex() {
        let tally = TallyInput::default();
        let input = InputEndpoint::Sync(Arc::new(tally.clone()));
        let output = OutputEndpoint::Sync(Arc::new(BlobOutput {
            payload: b"hello".to_vec(),
        }));
        let (a, b) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let (produced, consumed) = tokio::join!(
            output.produce(a, "t", "in", token.clone()),
            input.consume(b, "b", "out", token.clone()),
        );
        produced.1.unwrap();
        consumed.1.unwrap();
        assert_eq!(tally.totals(), (1, 5));
    }

    #[tokio::test]
    async fn test_read_records_rejects_negative_count() {
        let mut buf = bytes::BytesMut::new();
        codec::encode_i32(-1, &mut buf);
        let mut slice = &buf[..];
        let err = read_records(&mut slice, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
