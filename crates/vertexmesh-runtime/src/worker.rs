//! Worker process: hosts vertices, serves the control protocol and keeps
//! its connections reconciled with the desired graph.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vertexmesh_transport::protocol::write_status;
use vertexmesh_transport::secure::secure_inbound;
use vertexmesh_transport::{
    Connection, ConnectStatus, ConnectionKey, ControlRequest, Direction, MetricsSnapshot,
};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::handshake::{connect_initiator_side, connect_receiver_side};
use crate::metastore::{InstanceRecord, MetadataStore, VertexRecord};
use crate::reconcile;
use crate::registry::RegistryMap;
use crate::services::{ServiceOptions, WorkerServices};
use crate::vertex::VertexCatalog;

/// A running worker.
///
/// Dropping the worker stops its tasks without touching the metadata store,
/// which is what a crash looks like to peers. [`Worker::shutdown`] also
/// unregisters it.
pub struct Worker {
    ctx: Arc<WorkerServices>,
    local_addr: SocketAddr,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("instance", &self.ctx.instance_name)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Worker {
    /// Starts a worker from `config`, loading TLS material if configured.
    pub async fn start(
        config: &WorkerConfig,
        metastore: Arc<dyn MetadataStore>,
        catalog: VertexCatalog,
    ) -> Result<Self> {
        config.validate()?;
        let options = config.service_options()?;
        Self::start_with_options(config, metastore, catalog, options).await
    }

    /// Starts a worker with explicit service options.
    ///
    /// Binds, registers the instance under its advertised address and bound
    /// port, re-hosts the vertices assigned to it, starts accepting and
    /// spawns startup restoration.
    pub async fn start_with_options(
        config: &WorkerConfig,
        metastore: Arc<dyn MetadataStore>,
        catalog: VertexCatalog,
        options: ServiceOptions,
    ) -> Result<Self> {
        let ctx = Arc::new(WorkerServices::new(
            config.instance_name.clone(),
            metastore,
            catalog,
            options,
        ));
        let listener = ctx.tcp.listen(&config.bind.to_socket_string()).await?;
        let local_addr = listener.local_addr()?;
        ctx.metastore
            .register_instance(InstanceRecord {
                name: ctx.instance_name.clone(),
                address: config.advertised_address().to_string(),
                port: local_addr.port(),
            })
            .await?;

        rehost_assigned(&ctx).await;
        let accept_loop = tokio::spawn(accept_loop(ctx.clone(), listener));
        reconcile::restore_all(&ctx).await;

        info!(
            instance = %ctx.instance_name,
            addr = %local_addr,
            vertices = ctx.vertices.len(),
            "worker started"
        );
        Ok(Self {
            ctx,
            local_addr,
            accept_loop: Mutex::new(Some(accept_loop)),
        })
    }

    /// Instance name.
    pub fn instance_name(&self) -> &str {
        &self.ctx.instance_name
    }

    /// Bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared services, for inspection.
    pub fn services(&self) -> &Arc<WorkerServices> {
        &self.ctx
    }

    /// Current counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Hosts a vertex here and restores its desired connections.
    pub async fn load_vertex(&self, name: &str, definition: &str, parameter: &[u8]) -> Result<()> {
        host_vertex(&self.ctx, name, definition, parameter).await
    }

    /// Establishes `key` from this worker.
    ///
    /// With `kill_if_exists`, a live entry for the key is replaced here and
    /// on the peer instead of reused.
    pub async fn connect(
        &self,
        key: &ConnectionKey,
        direction: Direction,
        kill_if_exists: bool,
    ) -> ConnectStatus {
        connect_initiator_side(&self.ctx, key, direction, kill_if_exists, kill_if_exists).await
    }

    /// Cancels any live pump for `key` on this worker, returning how many
    /// entries were cancelled.
    ///
    /// The desired graph is left alone, so a peer whose pump fails as a
    /// result will reconnect. Use [`Client::disconnect`](crate::Client::disconnect)
    /// to drop the connection for good.
    pub fn cancel_local(&self, key: &ConnectionKey) -> usize {
        disconnect_local(&self.ctx, key)
    }

    /// Stops every task, disposes hosted vertices and unregisters the
    /// instance and its endpoints. Vertex placement is kept so a restarted
    /// worker re-hosts the same vertices.
    pub async fn shutdown(&self) -> Result<()> {
        let ctx = &self.ctx;
        ctx.shutdown.cancel();
        let cancelled = ctx.registry.cancel_all();
        let accept_loop = self.accept_loop.lock().take();
        if let Some(handle) = accept_loop {
            if let Err(e) = handle.await {
                warn!(error = %e, "accept loop ended abnormally");
            }
        }
        ctx.pool.clear();
        for hosted in ctx.vertices.dispose_all() {
            if let Err(e) = ctx.metastore.remove_endpoints(hosted.name()).await {
                warn!(vertex = %hosted.name(), error = %e, "failed to remove endpoints");
            }
        }
        ctx.metastore.remove_instance(&ctx.instance_name).await?;
        info!(instance = %ctx.instance_name, cancelled, "worker stopped");
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

async fn rehost_assigned(ctx: &Arc<WorkerServices>) {
    let records = match ctx.metastore.vertices_on(&ctx.instance_name).await {
        Ok(records) => records,
        Err(e) => {
            warn!(instance = %ctx.instance_name, error = %e, "cannot list assigned vertices");
            return;
        }
    };
    for record in records {
        let hosted = match ctx.vertices.load(
            &ctx.catalog,
            &record.vertex_name,
            &record.definition,
            &record.parameter,
        ) {
            Ok(hosted) => hosted,
            Err(e) => {
                warn!(vertex = %record.vertex_name, error = %e, "cannot re-host vertex");
                continue;
            }
        };
        if let Err(e) = ctx
            .metastore
            .register_endpoints(&record.vertex_name, hosted.endpoints().identities())
            .await
        {
            warn!(vertex = %record.vertex_name, error = %e, "cannot register endpoints");
        }
    }
}

async fn host_vertex(
    ctx: &Arc<WorkerServices>,
    name: &str,
    definition: &str,
    parameter: &[u8],
) -> Result<()> {
    let hosted = ctx.vertices.load(&ctx.catalog, name, definition, parameter)?;
    let record = VertexRecord {
        vertex_name: name.to_string(),
        instance_name: ctx.instance_name.clone(),
        definition: definition.to_string(),
        parameter: parameter.to_vec(),
    };
    let registered = async {
        ctx.metastore.register_vertex(record).await?;
        ctx.metastore
            .register_endpoints(name, hosted.endpoints().identities())
            .await
    };
    if let Err(e) = registered.await {
        ctx.vertices.unload(name);
        return Err(e);
    }
    reconcile::restore_vertex(ctx, name).await;
    Ok(())
}

fn disconnect_local(ctx: &WorkerServices, key: &ConnectionKey) -> usize {
    let cancelled = [RegistryMap::Outbound, RegistryMap::Inbound]
        .into_iter()
        .filter(|map| ctx.registry.cancel(*map, key))
        .count();
    debug!(key = %key, cancelled, "disconnect");
    cancelled
}

async fn accept_loop(ctx: Arc<WorkerServices>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = ctx.tcp.accept(&listener) => accepted,
        };
        match accepted {
            Ok(conn) => {
                ctx.metrics.inc_connections_accepted();
                tokio::spawn(serve(ctx.clone(), conn));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    debug!(instance = %ctx.instance_name, "accept loop stopped");
}

async fn serve(ctx: Arc<WorkerServices>, conn: Connection) {
    let peer = conn.pool_key();
    match secure_inbound(ctx.secure.as_ref(), conn).await {
        Ok(conn) => dispatch(ctx, conn).await,
        Err(e) => warn!(addr = %peer, error = %e, "inbound secure handshake failed"),
    }
}

async fn respond(mut conn: Connection, status: ConnectStatus) -> Option<Connection> {
    match write_status(&mut conn, status).await {
        Ok(()) => Some(conn),
        Err(e) => {
            debug!(addr = %conn.pool_key(), error = %e, "reply failed");
            None
        }
    }
}

/// Serves control requests on an accepted connection until it closes.
async fn dispatch(ctx: Arc<WorkerServices>, mut conn: Connection) {
    let peer = conn.pool_key();
    loop {
        let request = tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            request = ControlRequest::read_from(&mut conn) => request,
        };
        let request = match request {
            Ok(request) => request,
            Err(e) if e.is_protocol_error() => {
                warn!(addr = %peer, error = %e, "closing connection after protocol error");
                return;
            }
            Err(e) => {
                debug!(addr = %peer, error = %e, "connection closed");
                return;
            }
        };
        debug!(addr = %peer, opcode = ?request.opcode(), "request");

        let next = match request {
            ControlRequest::Ping => respond(conn, ConnectStatus::Success).await,
            ControlRequest::LoadVertex {
                vertex_name,
                definition,
                parameter,
            } => {
                let status = match host_vertex(&ctx, &vertex_name, &definition, &parameter).await {
                    Ok(()) => ConnectStatus::Success,
                    Err(e) => {
                        warn!(vertex = %vertex_name, error = %e, "vertex load failed");
                        ConnectStatus::VertexLoadFailed
                    }
                };
                respond(conn, status).await
            }
            ControlRequest::ConnectInitiator { key, direction } => {
                let status = connect_initiator_side(&ctx, &key, direction, false, false).await;
                respond(conn, status).await
            }
            ControlRequest::ConnectReceiver {
                key,
                direction,
                kill_if_exists,
            } => connect_receiver_side(&ctx, conn, &key, direction, kill_if_exists).await,
            ControlRequest::Disconnect { key } => {
                disconnect_local(&ctx, &key);
                respond(conn, ConnectStatus::Success).await
            }
        };
        match next {
            Some(back) => conn = back,
            None => return,
        }
    }
}
