//! Client API: edits the desired graph and asks workers to act on it.

use std::sync::Arc;

use tracing::{debug, warn};
use vertexmesh_transport::protocol::read_status;
use vertexmesh_transport::secure::secure_outbound;
use vertexmesh_transport::{
    Connection, ConnectStatus, ConnectionKey, ConnectionPool, ControlRequest, Direction,
    MetricsSnapshot, SecureTransport, TcpTransport, TransportMetrics,
};

use crate::error::{Result, RuntimeError};
use crate::metastore::{MetadataStore, VertexLocation};
use crate::services::ServiceOptions;

/// Talks to workers on behalf of an application.
pub struct Client {
    metastore: Arc<dyn MetadataStore>,
    pool: ConnectionPool,
    tcp: TcpTransport,
    secure: Option<Arc<dyn SecureTransport>>,
    metrics: Arc<TransportMetrics>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("pool", &self.pool).finish()
    }
}

impl Client {
    /// Client over `metastore`. The retry policy in `options` is unused.
    pub fn new(metastore: Arc<dyn MetadataStore>, options: ServiceOptions) -> Self {
        let metrics = Arc::new(TransportMetrics::new());
        Self {
            metastore,
            pool: ConnectionPool::new(options.pool, metrics.clone()),
            tcp: TcpTransport::new(options.tcp),
            secure: options.secure,
            metrics,
        }
    }

    /// Metadata store in use.
    pub fn metastore(&self) -> &Arc<dyn MetadataStore> {
        &self.metastore
    }

    /// Current counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn open(&self, location: &VertexLocation) -> Result<Connection> {
        if let Some(conn) = self.pool.try_borrow(&location.address, location.port).await {
            return Ok(conn);
        }
        let conn = self.tcp.connect(&location.address, location.port).await?;
        self.metrics.inc_connections_opened();
        Ok(secure_outbound(self.secure.as_ref(), conn, &location.instance).await?)
    }

    async fn send(&self, location: &VertexLocation, request: &ControlRequest) -> Result<ConnectStatus> {
        let mut conn = self.open(location).await?;
        request.write_to(&mut conn).await?;
        let status = read_status(&mut conn).await?;
        self.pool.give_back(conn);
        debug!(instance = %location.instance, opcode = ?request.opcode(), %status, "request answered");
        Ok(status)
    }

    /// Asks `instance` to host a vertex.
    pub async fn load_vertex(
        &self,
        instance: &str,
        vertex_name: &str,
        definition: &str,
        parameter: &[u8],
    ) -> Result<ConnectStatus> {
        let record = self
            .metastore
            .instance(instance)
            .await?
            .ok_or_else(|| RuntimeError::metadata(format!("unknown instance {}", instance)))?;
        let location = VertexLocation {
            instance: record.name,
            address: record.address,
            port: record.port,
        };
        let request = ControlRequest::LoadVertex {
            vertex_name: vertex_name.to_string(),
            definition: definition.to_string(),
            parameter: parameter.to_vec(),
        };
        self.send(&location, &request).await
    }

    /// Records `key` as desired and asks the driving worker to establish it.
    ///
    /// The from vertex drives `Forward`, the to vertex drives `Reverse`. The
    /// desired entry stays even when the attempt fails, so workers keep
    /// reconciling towards it.
    pub async fn connect(&self, key: &ConnectionKey, direction: Direction) -> Result<ConnectStatus> {
        self.metastore.add_connection(key).await?;
        let driving = match direction {
            Direction::Forward => &key.from_vertex,
            Direction::Reverse => &key.to_vertex,
        };
        let Some(location) = self.metastore.resolve_vertex(driving).await? else {
            return Ok(ConnectStatus::VertexNotFound);
        };
        let request = ControlRequest::ConnectInitiator {
            key: key.clone(),
            direction,
        };
        self.send(&location, &request).await
    }

    /// Removes `key` from the desired graph and tears down live pumps on the
    /// workers hosting either end.
    pub async fn disconnect(&self, key: &ConnectionKey) -> Result<bool> {
        let existed = self.metastore.remove_connection(key).await?;
        let mut vertices = vec![&key.from_vertex];
        if key.to_vertex != key.from_vertex {
            vertices.push(&key.to_vertex);
        }
        let mut notified: Vec<String> = Vec::new();
        for vertex in vertices {
            let location = match self.metastore.resolve_vertex(vertex).await? {
                Some(location) => location,
                None => continue,
            };
            if notified.contains(&location.instance) {
                continue;
            }
            let request = ControlRequest::Disconnect { key: key.clone() };
            match self.send(&location, &request).await {
                Ok(_) => notified.push(location.instance),
                Err(e) => {
                    warn!(instance = %location.instance, key = %key, error = %e, "disconnect not delivered")
                }
            }
        }
        Ok(existed)
    }

    /// Every desired connection.
    pub async fn desired_connections(&self) -> Result<Vec<ConnectionKey>> {
        self.metastore.connections().await
    }
}
