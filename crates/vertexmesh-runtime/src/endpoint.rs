//! Endpoint capabilities a hosted vertex implements.
//!
//! Four kinds exist: sync and async, input and output. Sync endpoints are
//! handed blocking `Read`/`Write` adapters and run on the blocking pool;
//! async endpoints are handed the transport stream directly. An async output
//! may additionally be fusable, which lets a colocated connection bypass the
//! network entirely.
//!
//! The kind is fixed when the endpoint is registered ([`InputEndpoint`] and
//! [`OutputEndpoint`] are closed sets), so the pump dispatches on a tag rather
//! than probing capabilities per call.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};

/// Blocking consumer of a byte stream.
pub trait SyncInputEndpoint: Send + Sync + 'static {
    /// Consumes what this endpoint expects from `stream`, produced by
    /// `other_vertex`/`other_endpoint`. Long loops should poll `token`.
    fn from_stream(
        &self,
        stream: &mut dyn Read,
        other_vertex: &str,
        other_endpoint: &str,
        token: &CancellationToken,
    ) -> io::Result<()>;
}

/// Blocking producer of a byte stream.
pub trait SyncOutputEndpoint: Send + Sync + 'static {
    /// Writes this endpoint's data into `stream` for `other_vertex`/`other_endpoint`.
    fn to_stream(
        &self,
        stream: &mut dyn Write,
        other_vertex: &str,
        other_endpoint: &str,
        token: &CancellationToken,
    ) -> io::Result<()>;
}

/// Async consumer of a byte stream.
#[async_trait]
pub trait AsyncInputEndpoint: Send + Sync + 'static {
    /// Consumes what this endpoint expects from `stream`.
    async fn from_stream(
        &self,
        stream: &mut (dyn AsyncRead + Unpin + Send),
        other_vertex: &str,
        other_endpoint: &str,
        token: CancellationToken,
    ) -> io::Result<()>;
}

/// Async producer of a byte stream.
#[async_trait]
pub trait AsyncOutputEndpoint: Send + Sync + 'static {
    /// Writes this endpoint's data into `stream`.
    async fn to_stream(
        &self,
        stream: &mut (dyn AsyncWrite + Unpin + Send),
        other_vertex: &str,
        other_endpoint: &str,
        token: CancellationToken,
    ) -> io::Result<()>;
}

/// Async output that can hand data to a colocated input without a socket.
#[async_trait]
pub trait FusableOutputEndpoint: AsyncOutputEndpoint {
    /// Whether this output can feed `input` directly.
    fn can_fuse_with(&self, input: &InputEndpoint, other_vertex: &str, other_endpoint: &str)
        -> bool;

    /// Transfers data to `input` in-process. Only called after
    /// [`FusableOutputEndpoint::can_fuse_with`] returned true.
    async fn to_input(
        &self,
        input: &InputEndpoint,
        other_vertex: &str,
        other_endpoint: &str,
        token: CancellationToken,
    ) -> io::Result<()>;
}

/// Direction of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointDirection {
    /// Consumes bytes.
    Input,
    /// Produces bytes.
    Output,
}

/// Execution mode of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointMode {
    /// Runs on the blocking pool.
    Sync,
    /// Runs on the async runtime.
    Async,
}

/// Metadata record describing one registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointIdentity {
    /// Owning vertex.
    pub vertex_name: String,
    /// Endpoint name, unique per vertex and direction.
    pub endpoint_name: String,
    /// Input or output.
    pub direction: EndpointDirection,
    /// Sync or async.
    pub mode: EndpointMode,
    /// Whether the endpoint can fuse with colocated inputs.
    pub fusable: bool,
}

/// A registered input endpoint.
#[derive(Clone)]
pub enum InputEndpoint {
    /// Blocking consumer.
    Sync(Arc<dyn SyncInputEndpoint>),
    /// Async consumer.
    Async(Arc<dyn AsyncInputEndpoint>),
}

impl std::fmt::Debug for InputEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputEndpoint::Sync(_) => f.write_str("InputEndpoint::Sync"),
            InputEndpoint::Async(_) => f.write_str("InputEndpoint::Async"),
        }
    }
}

impl InputEndpoint {
    /// Execution mode of the variant.
    pub fn mode(&self) -> EndpointMode {
        match self {
            InputEndpoint::Sync(_) => EndpointMode::Sync,
            InputEndpoint::Async(_) => EndpointMode::Async,
        }
    }

    /// Runs the endpoint against `stream` and hands the stream back.
    ///
    /// The stream is `None` only when a blocking endpoint panicked while it
    /// held the stream.
    pub async fn consume<S>(
        &self,
        mut stream: S,
        other_vertex: &str,
        other_endpoint: &str,
        token: CancellationToken,
    ) -> (Option<S>, io::Result<()>)
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        match self {
            InputEndpoint::Async(endpoint) => {
                let result = endpoint
                    .from_stream(&mut stream, other_vertex, other_endpoint, token)
                    .await;
                (Some(stream), result)
            }
            InputEndpoint::Sync(endpoint) => {
                let endpoint = endpoint.clone();
                let other_vertex = other_vertex.to_string();
                let other_endpoint = other_endpoint.to_string();
                let mut bridge = SyncIoBridge::new(stream);
                let joined = tokio::task::spawn_blocking(move || {
                    let result =
                        endpoint.from_stream(&mut bridge, &other_vertex, &other_endpoint, &token);
                    (bridge.into_inner(), result)
                })
                .await;
                match joined {
                    Ok((stream, result)) => (Some(stream), result),
                    Err(e) => (None, Err(io::Error::other(e))),
                }
            }
        }
    }
}

/// A registered output endpoint.
#[derive(Clone)]
pub enum OutputEndpoint {
    /// Blocking producer.
    Sync(Arc<dyn SyncOutputEndpoint>),
    /// Async producer.
    Async(Arc<dyn AsyncOutputEndpoint>),
    /// Async producer that can also fuse with colocated inputs.
    Fusable(Arc<dyn FusableOutputEndpoint>),
}

impl std::fmt::Debug for OutputEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputEndpoint::Sync(_) => f.write_str("OutputEndpoint::Sync"),
            OutputEndpoint::Async(_) => f.write_str("OutputEndpoint::Async"),
            OutputEndpoint::Fusable(_) => f.write_str("OutputEndpoint::Fusable"),
        }
    }
}

impl OutputEndpoint {
    /// Execution mode of the variant.
    pub fn mode(&self) -> EndpointMode {
        match self {
            OutputEndpoint::Sync(_) => EndpointMode::Sync,
            OutputEndpoint::Async(_) | OutputEndpoint::Fusable(_) => EndpointMode::Async,
        }
    }

    /// The fusable capability, if this endpoint has it.
    pub fn as_fusable(&self) -> Option<&Arc<dyn FusableOutputEndpoint>> {
        match self {
            OutputEndpoint::Fusable(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    /// Runs the endpoint against `stream`, flushes, and hands the stream back.
    ///
    /// As with [`InputEndpoint::consume`], the stream is lost if a blocking
    /// endpoint panics.
    pub async fn produce<S>(
        &self,
        mut stream: S,
        other_vertex: &str,
        other_endpoint: &str,
        token: CancellationToken,
    ) -> (Option<S>, io::Result<()>)
    where
        S: AsyncWrite + Unpin + Send + 'static,
    {
        let (stream, result) = match self {
            OutputEndpoint::Async(endpoint) => {
                let result = endpoint
                    .to_stream(&mut stream, other_vertex, other_endpoint, token)
                    .await;
                (Some(stream), result)
            }
            OutputEndpoint::Fusable(endpoint) => {
                let result = endpoint
                    .to_stream(&mut stream, other_vertex, other_endpoint, token)
                    .await;
                (Some(stream), result)
            }
            OutputEndpoint::Sync(endpoint) => {
                let endpoint = endpoint.clone();
                let other_vertex = other_vertex.to_string();
                let other_endpoint = other_endpoint.to_string();
                let mut bridge = SyncIoBridge::new(stream);
                let joined = tokio::task::spawn_blocking(move || {
                    let result = endpoint
                        .to_stream(&mut bridge, &other_vertex, &other_endpoint, &token)
                        .and_then(|()| bridge.flush());
                    (bridge.into_inner(), result)
                })
                .await;
                match joined {
                    Ok((stream, result)) => (Some(stream), result),
                    Err(e) => (None, Err(io::Error::other(e))),
                }
            }
        };
        match (stream, result) {
            (Some(mut stream), Ok(())) => {
                let flushed = stream.flush().await;
                (Some(stream), flushed)
            }
            other => other,
        }
    }
}

/// Feeds `input` from `output` through an in-memory pipe.
///
/// A convenience for [`FusableOutputEndpoint::to_input`] implementations that
/// keep their byte format: no socket is involved, both halves run
/// concurrently on the current task.
pub async fn pipe_into(
    output: &dyn AsyncOutputEndpoint,
    input: &InputEndpoint,
    from: (&str, &str),
    to: (&str, &str),
    token: CancellationToken,
) -> io::Result<()> {
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let produce = async {
        output
            .to_stream(&mut writer, to.0, to.1, token.clone())
            .await?;
        writer.shutdown().await
    };
    let consume = async {
        let (_, result) = input.consume(reader, from.0, from.1, token.clone()).await;
        result
    };
    let (produced, consumed) = tokio::join!(produce, consume);
    produced.and(consumed)
}

/// The endpoints a vertex registers while it initializes.
#[derive(Debug, Default, Clone)]
pub struct EndpointSet {
    vertex_name: String,
    inputs: HashMap<String, InputEndpoint>,
    outputs: HashMap<String, OutputEndpoint>,
}

impl EndpointSet {
    /// Empty set for `vertex_name`.
    pub fn new(vertex_name: impl Into<String>) -> Self {
        Self {
            vertex_name: vertex_name.into(),
            ..Default::default()
        }
    }

    /// Vertex the endpoints belong to.
    pub fn vertex_name(&self) -> &str {
        &self.vertex_name
    }

    fn add_input(&mut self, name: &str, endpoint: InputEndpoint) -> Result<()> {
        if self.inputs.contains_key(name) {
            return Err(RuntimeError::DuplicateEndpoint {
                vertex: self.vertex_name.clone(),
                endpoint: name.to_string(),
            });
        }
        self.inputs.insert(name.to_string(), endpoint);
        Ok(())
    }

    fn add_output(&mut self, name: &str, endpoint: OutputEndpoint) -> Result<()> {
        if self.outputs.contains_key(name) {
            return Err(RuntimeError::DuplicateEndpoint {
                vertex: self.vertex_name.clone(),
                endpoint: name.to_string(),
            });
        }
        self.outputs.insert(name.to_string(), endpoint);
        Ok(())
    }

    /// Registers a blocking input.
    pub fn add_sync_input(&mut self, name: &str, endpoint: impl SyncInputEndpoint) -> Result<()> {
        self.add_input(name, InputEndpoint::Sync(Arc::new(endpoint)))
    }

    /// Registers an async input.
    pub fn add_async_input(&mut self, name: &str, endpoint: impl AsyncInputEndpoint) -> Result<()> {
        self.add_input(name, InputEndpoint::Async(Arc::new(endpoint)))
    }

    /// Registers a blocking output.
    pub fn add_sync_output(&mut self, name: &str, endpoint: impl SyncOutputEndpoint) -> Result<()> {
        self.add_output(name, OutputEndpoint::Sync(Arc::new(endpoint)))
    }

    /// Registers an async output.
    pub fn add_async_output(
        &mut self,
        name: &str,
        endpoint: impl AsyncOutputEndpoint,
    ) -> Result<()> {
        self.add_output(name, OutputEndpoint::Async(Arc::new(endpoint)))
    }

    /// Registers a fusable async output.
    pub fn add_fusable_output(
        &mut self,
        name: &str,
        endpoint: impl FusableOutputEndpoint,
    ) -> Result<()> {
        self.add_output(name, OutputEndpoint::Fusable(Arc::new(endpoint)))
    }

    /// Looks up an input by name.
    pub fn input(&self, name: &str) -> Option<&InputEndpoint> {
        self.inputs.get(name)
    }

    /// Looks up an output by name.
    pub fn output(&self, name: &str) -> Option<&OutputEndpoint> {
        self.outputs.get(name)
    }

    /// Metadata records for every registered endpoint.
    pub fn identities(&self) -> Vec<EndpointIdentity> {
        let inputs = self.inputs.iter().map(|(name, ep)| EndpointIdentity {
            vertex_name: self.vertex_name.clone(),
            endpoint_name: name.clone(),
            direction: EndpointDirection::Input,
            mode: ep.mode(),
            fusable: false,
        });
        let outputs = self.outputs.iter().map(|(name, ep)| EndpointIdentity {
            vertex_name: self.vertex_name.clone(),
            endpoint_name: name.clone(),
            direction: EndpointDirection::Output,
            mode: ep.mode(),
            fusable: ep.as_fusable().is_some(),
        });
        let mut all: Vec<_> = inputs.chain(outputs).collect();
        all.sort_by(|a, b| a.endpoint_name.cmp(&b.endpoint_name));
        all
    }
}
