//! Shared fixtures for the multi-worker integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use vertexmesh_runtime::builtin::{self, TallyInput};
use vertexmesh_runtime::{
    AsyncInputEndpoint, AsyncOutputEndpoint, BindAddr, EndpointSet, InMemoryMetadataStore,
    MetadataStore, RetryPolicy, Vertex, VertexCatalog, Worker, WorkerConfig,
};
use vertexmesh_transport::codec;

/// Output writing `0, 1, 2, ...` as varints every few milliseconds until
/// its connection is cancelled.
pub struct Ticker {
    interval: Duration,
}

#[async_trait]
impl AsyncOutputEndpoint for Ticker {
    async fn to_stream(
        &self,
        stream: &mut (dyn AsyncWrite + Unpin + Send),
        _other_vertex: &str,
        _other_endpoint: &str,
        token: CancellationToken,
    ) -> io::Result<()> {
        let mut next = 0i32;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
            codec::write_i32(stream, next).await.map_err(io::Error::other)?;
            next = next.wrapping_add(1);
        }
    }
}

struct TickerVertex;

impl Vertex for TickerVertex {
    fn initialize(
        &mut self,
        parameter: &[u8],
        endpoints: &mut EndpointSet,
    ) -> vertexmesh_runtime::Result<()> {
        let ms = std::str::from_utf8(parameter)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        endpoints.add_async_output(
            "out",
            Ticker {
                interval: Duration::from_millis(ms),
            },
        )
    }
}

/// Input recording every varint it reads.
#[derive(Clone, Default)]
pub struct Collect {
    seen: Arc<Mutex<Vec<i32>>>,
}

impl Collect {
    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

#[async_trait]
impl AsyncInputEndpoint for Collect {
    async fn from_stream(
        &self,
        stream: &mut (dyn AsyncRead + Unpin + Send),
        _other_vertex: &str,
        _other_endpoint: &str,
        token: CancellationToken,
    ) -> io::Result<()> {
        loop {
            let value = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                value = codec::read_i32(stream) => value.map_err(io::Error::other)?,
            };
            self.seen.lock().push(value);
        }
    }
}

struct CollectVertex(Collect);

impl Vertex for CollectVertex {
    fn initialize(
        &mut self,
        _parameter: &[u8],
        endpoints: &mut EndpointSet,
    ) -> vertexmesh_runtime::Result<()> {
        endpoints.add_async_input("in", self.0.clone())
    }
}

struct TallyVertex(TallyInput);

impl Vertex for TallyVertex {
    fn initialize(
        &mut self,
        _parameter: &[u8],
        endpoints: &mut EndpointSet,
    ) -> vertexmesh_runtime::Result<()> {
        endpoints.add_sync_input("in", self.0.clone())
    }
}

/// Recorders shared between the test and every vertex built from a catalog.
#[derive(Clone, Default)]
pub struct Recorders {
    pub collect: Collect,
    pub tally: TallyInput,
}

impl Recorders {
    /// Built-ins plus `ticker`, `collect` and `shared-tally`.
    pub fn catalog(&self) -> VertexCatalog {
        let mut catalog = builtin::catalog();
        let collect = self.collect.clone();
        let tally = self.tally.clone();
        catalog
            .register("ticker", || TickerVertex)
            .register("collect", move || CollectVertex(collect.clone()))
            .register("shared-tally", move || TallyVertex(tally.clone()));
        catalog
    }
}

pub fn store() -> Arc<InMemoryMetadataStore> {
    Arc::new(InMemoryMetadataStore::new())
}

pub fn worker_config(name: &str) -> WorkerConfig {
    WorkerConfig {
        instance_name: name.to_string(),
        bind: BindAddr::new("127.0.0.1", 0),
        retry: RetryPolicy {
            backoff_ms: 50,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn start_worker(
    name: &str,
    store: &Arc<InMemoryMetadataStore>,
    recorders: &Recorders,
) -> Worker {
    let metastore: Arc<dyn MetadataStore> = store.clone();
    Worker::start(&worker_config(name), metastore, recorders.catalog())
        .await
        .expect("worker starts")
}

/// Polls `condition` until it holds or ten seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
