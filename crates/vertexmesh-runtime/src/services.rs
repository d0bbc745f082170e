//! Services shared by every handshake, pump and retry task of one worker.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vertexmesh_transport::{
    ConnectionPool, PoolConfig, SecureTransport, TcpTransport, TcpTransportConfig,
    TransportMetrics,
};

use crate::metastore::MetadataStore;
use crate::reconcile::RetryPolicy;
use crate::registry::ConnectionRegistry;
use crate::vertex::{VertexCatalog, VertexTable};

/// Tunables for [`WorkerServices::new`].
#[derive(Clone, Default)]
pub struct ServiceOptions {
    /// Connection pool bounds.
    pub pool: PoolConfig,
    /// Dialing behaviour.
    pub tcp: TcpTransportConfig,
    /// Retry pacing.
    pub retry: RetryPolicy,
    /// Optional stream wrapper applied to every dial and accept.
    pub secure: Option<Arc<dyn SecureTransport>>,
}

impl std::fmt::Debug for ServiceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceOptions")
            .field("pool", &self.pool)
            .field("tcp", &self.tcp)
            .field("retry", &self.retry)
            .field("secure", &self.secure.is_some())
            .finish()
    }
}

/// Everything a worker's tasks share, owned by the worker.
pub struct WorkerServices {
    /// This worker's instance name.
    pub instance_name: String,
    /// Shared metadata store.
    pub metastore: Arc<dyn MetadataStore>,
    /// Idle connections to peers.
    pub pool: Arc<ConnectionPool>,
    /// Live connections.
    pub registry: ConnectionRegistry,
    /// Hosted vertices.
    pub vertices: VertexTable,
    /// Definitions this worker can load.
    pub catalog: VertexCatalog,
    /// Dialer.
    pub tcp: TcpTransport,
    /// Optional stream wrapper.
    pub secure: Option<Arc<dyn SecureTransport>>,
    /// Counters.
    pub metrics: Arc<TransportMetrics>,
    /// Retry pacing.
    pub retry: RetryPolicy,
    /// Root token; cancelling it stops every task of the worker.
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for WorkerServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerServices")
            .field("instance_name", &self.instance_name)
            .field("vertices", &self.vertices.names())
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish()
    }
}

impl WorkerServices {
    /// Builds the services of worker `instance_name`.
    pub fn new(
        instance_name: impl Into<String>,
        metastore: Arc<dyn MetadataStore>,
        catalog: VertexCatalog,
        options: ServiceOptions,
    ) -> Self {
        let metrics = Arc::new(TransportMetrics::new());
        let shutdown = CancellationToken::new();
        Self {
            instance_name: instance_name.into(),
            metastore,
            pool: Arc::new(ConnectionPool::new(options.pool, metrics.clone())),
            registry: ConnectionRegistry::new(shutdown.clone()),
            vertices: VertexTable::new(),
            catalog,
            tcp: TcpTransport::new(options.tcp),
            secure: options.secure,
            metrics,
            retry: options.retry,
            shutdown,
        }
    }
}
