//! Data-plane pump: runs a local endpoint against a connection until it
//! completes, fails or is cancelled, then settles the registry entry.
//!
//! Settlement rules:
//! - the pump always removes its own entry, and only its own;
//! - a completed dialed connection goes back to the pool, a completed
//!   accepted connection goes back to the dispatch loop;
//! - a cancelled pump drops its connection and never retries;
//! - a failed pump drops its connection and, if it still owned the entry,
//!   hands the key to the retry loop driving from this side.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vertexmesh_transport::{Connection, ConnectionKey, Direction};

use crate::endpoint::{FusableOutputEndpoint, InputEndpoint, OutputEndpoint};
use crate::reconcile::spawn_retry;
use crate::registry::{RegistryMap, Registration};
use crate::services::WorkerServices;

/// The local end of a connection.
#[derive(Debug, Clone)]
pub enum PumpSide {
    /// This worker hosts the from endpoint and writes.
    Source(OutputEndpoint),
    /// This worker hosts the to endpoint and reads.
    Sink(InputEndpoint),
}

impl PumpSide {
    /// Registry map the side registers under.
    pub fn map(&self) -> RegistryMap {
        match self {
            PumpSide::Source(_) => RegistryMap::Outbound,
            PumpSide::Sink(_) => RegistryMap::Inbound,
        }
    }

    /// Direction that lets this side drive a reconnect.
    pub fn retry_direction(&self) -> Direction {
        match self {
            PumpSide::Source(_) => Direction::Forward,
            PumpSide::Sink(_) => Direction::Reverse,
        }
    }
}

/// How a pump ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The endpoint returned normally.
    Completed,
    /// The entry's token fired.
    Cancelled,
    /// The endpoint or the stream failed.
    Failed(String),
}

/// A registered connection ready to pump.
#[derive(Debug)]
pub struct PumpTask {
    /// Connection served.
    pub key: ConnectionKey,
    /// Registry entry owned by the pump.
    pub registration: Registration,
    /// Local endpoint.
    pub side: PumpSide,
}

async fn pump_stream(task: &PumpTask, conn: Connection) -> (PumpOutcome, Option<Connection>) {
    let token = task.registration.token.clone();
    let key = &task.key;
    let work = async {
        match &task.side {
            PumpSide::Source(output) => {
                output
                    .produce(conn, &key.to_vertex, &key.to_endpoint, token.clone())
                    .await
            }
            PumpSide::Sink(input) => {
                input
                    .consume(conn, &key.from_vertex, &key.from_endpoint, token.clone())
                    .await
            }
        }
    };
    tokio::select! {
        _ = token.cancelled() => (PumpOutcome::Cancelled, None),
        (conn, result) = work => match result {
            _ if token.is_cancelled() => (PumpOutcome::Cancelled, None),
            Ok(()) => (PumpOutcome::Completed, conn),
            Err(e) => (PumpOutcome::Failed(e.to_string()), None),
        },
    }
}

fn settle(ctx: &Arc<WorkerServices>, task: &PumpTask, outcome: &PumpOutcome) {
    let map = task.side.map();
    let key = &task.key;
    let owned = ctx.registry.remove_own(map, key, task.registration.id);
    if !owned {
        debug!(key = %key, map = ?map, "registry entry already replaced or cancelled");
    }
    match outcome {
        PumpOutcome::Completed => {
            ctx.metrics.inc_pumps_completed();
            debug!(key = %key, map = ?map, "pump completed");
        }
        PumpOutcome::Cancelled => {
            ctx.metrics.inc_pumps_cancelled();
            debug!(key = %key, map = ?map, "pump cancelled");
        }
        PumpOutcome::Failed(reason) => {
            ctx.metrics.inc_pumps_failed();
            if owned && !ctx.shutdown.is_cancelled() {
                let direction = task.side.retry_direction();
                warn!(key = %key, error = %reason, ?direction, "pump failed, reconnecting");
                spawn_retry(ctx.clone(), key.clone(), direction);
            } else {
                debug!(key = %key, error = %reason, "pump failed after losing its entry");
            }
        }
    }
}

/// Pumps a connection this worker dialed, on its own task.
pub fn spawn_pump(ctx: Arc<WorkerServices>, task: PumpTask, conn: Connection) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (outcome, conn) = pump_stream(&task, conn).await;
        settle(&ctx, &task, &outcome);
        if let (PumpOutcome::Completed, Some(conn)) = (outcome, conn) {
            ctx.pool.give_back(conn);
        }
    })
}

/// Pumps a connection this worker accepted, inline in its dispatch task.
///
/// Returns the connection for further requests when the pump completed.
pub async fn run_accepted(
    ctx: &Arc<WorkerServices>,
    task: PumpTask,
    conn: Connection,
) -> Option<Connection> {
    let (outcome, conn) = pump_stream(&task, conn).await;
    settle(ctx, &task, &outcome);
    match outcome {
        PumpOutcome::Completed => conn,
        _ => None,
    }
}

/// Feeds a colocated input directly from a fusable output, on its own task.
pub fn spawn_fused(
    ctx: Arc<WorkerServices>,
    key: ConnectionKey,
    registration: Registration,
    output: Arc<dyn FusableOutputEndpoint>,
    input: InputEndpoint,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let token: CancellationToken = registration.token.clone();
        let outcome = tokio::select! {
            _ = token.cancelled() => PumpOutcome::Cancelled,
            result = output.to_input(&input, &key.to_vertex, &key.to_endpoint, token.clone()) => {
                match result {
                    _ if token.is_cancelled() => PumpOutcome::Cancelled,
                    Ok(()) => PumpOutcome::Completed,
                    Err(e) => PumpOutcome::Failed(e.to_string()),
                }
            }
        };
        let task = PumpTask {
            key,
            registration,
            side: PumpSide::Source(OutputEndpoint::Fusable(output)),
        };
        settle(&ctx, &task, &outcome);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{AsyncInputEndpoint, AsyncOutputEndpoint};
    use crate::metastore::InMemoryMetadataStore;
    use crate::services::ServiceOptions;
    use crate::vertex::VertexCatalog;
    use async_trait::async_trait;
    use std::io;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    fn services() -> Arc<WorkerServices> {
        Arc::new(WorkerServices::new(
            "w1",
            Arc::new(InMemoryMetadataStore::new()),
            VertexCatalog::new(),
            ServiceOptions::default(),
        ))
    }

    fn key() -> ConnectionKey {
        ConnectionKey::new("a", "out", "b", "in")
    }

    struct WriteByte;

    #[async_trait]
    impl AsyncOutputEndpoint for WriteByte {
        async fn to_stream(
            &self,
            stream: &mut (dyn AsyncWrite + Unpin + Send),
            _other_vertex: &str,
            _other_endpoint: &str,
            _token: CancellationToken,
        ) -> io::Result<()> {
            stream.write_all(&[7]).await
        }
    }

    struct ReadByte;

    #[async_trait]
    impl AsyncInputEndpoint for ReadByte {
        async fn from_stream(
            &self,
            stream: &mut (dyn AsyncRead + Unpin + Send),
            _other_vertex: &str,
            _other_endpoint: &str,
            _token: CancellationToken,
        ) -> io::Result<()> {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await?;
            Ok(())
        }
    }

    fn conn() -> (Connection, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(64);
        (Connection::new(Box::new(a), "10.0.0.9", 4000), b)
    }

    #[tokio::test]
    async fn test_completed_dialed_pump_returns_to_pool() {
        let ctx = services();
        let registration = ctx
            .registry
            .try_register(RegistryMap::Outbound, &key())
            .unwrap();
        let task = PumpTask {
            key: key(),
            registration,
            side: PumpSide::Source(OutputEndpoint::Async(Arc::new(WriteByte))),
        };
        let (conn, mut peer) = conn();
        spawn_pump(ctx.clone(), task, conn).await.unwrap();

        let mut byte = [0u8; 1];
        peer.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte, [7]);
        assert!(!ctx.registry.is_live(&key()));
        assert_eq!(ctx.pool.stats().idle_connections, 1);
        assert_eq!(ctx.metrics.snapshot().pumps_completed, 1);
    }

    #[tokio::test]
    async fn test_completed_accepted_pump_hands_back_connection() {
        let ctx = services();
        let registration = ctx
            .registry
            .try_register(RegistryMap::Inbound, &key())
            .unwrap();
        let task = PumpTask {
            key: key(),
            registration,
            side: PumpSide::Sink(InputEndpoint::Async(Arc::new(ReadByte))),
        };
        let (conn, mut peer) = conn();
        peer.write_all(&[1]).await.unwrap();
        let back = run_accepted(&ctx, task, conn).await;
        assert!(back.is_some());
        assert_eq!(ctx.pool.stats().idle_connections, 0);
    }

    #[tokio::test]
    async fn test_cancelled_pump_does_not_retry() {
        let ctx = services();
        let registration = ctx
            .registry
            .try_register(RegistryMap::Inbound, &key())
            .unwrap();
        let task = PumpTask {
            key: key(),
            registration,
            side: PumpSide::Sink(InputEndpoint::Async(Arc::new(ReadByte))),
        };
        let (conn, _peer) = conn();
        let handle = spawn_pump(ctx.clone(), task, conn);
        tokio::task::yield_now().await;
        assert!(ctx.registry.cancel(RegistryMap::Inbound, &key()));
        handle.await.unwrap();
        let snap = ctx.metrics.snapshot();
        assert_eq!(snap.pumps_cancelled, 1);
        assert_eq!(snap.retry_attempts, 0);
    }

    #[tokio::test]
    async fn test_failed_pump_releases_entry() {
        let ctx = services();
        let registration = ctx
            .registry
            .try_register(RegistryMap::Inbound, &key())
            .unwrap();
        let task = PumpTask {
            key: key(),
            registration,
            side: PumpSide::Sink(InputEndpoint::Async(Arc::new(ReadByte))),
        };
        let (conn, peer) = conn();
        drop(peer);
        assert!(run_accepted(&ctx, task, conn).await.is_none());
        assert!(!ctx.registry.is_live(&key()));
        assert_eq!(ctx.metrics.snapshot().pumps_failed, 1);
    }

    #[test]
    fn test_side_maps_and_directions() {
        let source = PumpSide::Source(OutputEndpoint::Async(Arc::new(WriteByte)));
        let sink = PumpSide::Sink(InputEndpoint::Async(Arc::new(ReadByte)));
        assert_eq!(source.map(), RegistryMap::Outbound);
        assert_eq!(sink.map(), RegistryMap::Inbound);
        assert_eq!(source.retry_direction(), Direction::Forward);
        assert_eq!(sink.retry_direction(), Direction::Reverse);
    }
}
