//! Connection handshake, initiator and receiver sides.
//!
//! The initiator resolves the peer vertex, fuses in-process when both ends
//! are hosted here and the output allows it, and otherwise dials the peer
//! worker with `CONNECT_RECEIVER`. The receiver validates its endpoint and
//! registry state, replies with one status, and on success pumps the
//! accepted connection inline.
//!
//! Both sides report failures as [`ConnectStatus`]; errors never escape.

use std::sync::Arc;

use tracing::{debug, warn};
use vertexmesh_transport::protocol::{read_status, write_status};
use vertexmesh_transport::secure::secure_outbound;
use vertexmesh_transport::{
    Connection, ConnectStatus, ConnectionKey, ControlRequest, Direction,
};

use crate::endpoint::{FusableOutputEndpoint, InputEndpoint};
use crate::metastore::VertexLocation;
use crate::pump::{self, PumpSide, PumpTask};
use crate::registry::RegistryMap;
use crate::services::WorkerServices;

/// Establishes `key` from this worker.
///
/// `direction` says which side this worker hosts: the from vertex for
/// `Forward`, the to vertex for `Reverse`. `kill_remote` asks the peer to
/// replace a live entry it holds; `kill_if_exists` replaces a live local
/// entry instead of reusing it.
pub async fn connect_initiator_side(
    ctx: &Arc<WorkerServices>,
    key: &ConnectionKey,
    direction: Direction,
    kill_remote: bool,
    kill_if_exists: bool,
) -> ConnectStatus {
    let status = initiate(ctx, key, direction, kill_remote, kill_if_exists).await;
    if status.is_success() {
        ctx.metrics.inc_handshakes_succeeded();
    } else {
        ctx.metrics.inc_handshakes_failed();
    }
    debug!(key = %key, ?direction, kill_remote, kill_if_exists, %status, "initiator handshake finished");
    status
}

fn local_side(
    ctx: &WorkerServices,
    key: &ConnectionKey,
    direction: Direction,
) -> Result<PumpSide, ConnectStatus> {
    match direction {
        Direction::Forward => ctx
            .vertices
            .output(&key.from_vertex, &key.from_endpoint)
            .map(PumpSide::Source),
        Direction::Reverse => ctx
            .vertices
            .input(&key.to_vertex, &key.to_endpoint)
            .map(PumpSide::Sink),
    }
}

async fn initiate(
    ctx: &Arc<WorkerServices>,
    key: &ConnectionKey,
    mut direction: Direction,
    kill_remote: bool,
    kill_if_exists: bool,
) -> ConnectStatus {
    let mut side = match local_side(ctx, key, direction) {
        Ok(side) => side,
        Err(status) => return status,
    };
    let remote_vertex = match direction {
        Direction::Forward => &key.to_vertex,
        Direction::Reverse => &key.from_vertex,
    };
    let location = match ctx.metastore.resolve_vertex(remote_vertex).await {
        Ok(Some(location)) => location,
        Ok(None) => return ConnectStatus::VertexNotFound,
        Err(e) => {
            warn!(key = %key, error = %e, "vertex resolution failed");
            return ConnectStatus::ConnectionEstablishFailed;
        }
    };

    if location.instance == ctx.instance_name {
        let output = match ctx.vertices.output(&key.from_vertex, &key.from_endpoint) {
            Ok(output) => output,
            Err(status) => return status,
        };
        let input = match ctx.vertices.input(&key.to_vertex, &key.to_endpoint) {
            Ok(input) => input,
            Err(status) => return status,
        };
        if let Some(fusable) = output.as_fusable() {
            if fusable.can_fuse_with(&input, &key.to_vertex, &key.to_endpoint) {
                return fuse(ctx, key, fusable.clone(), input, kill_if_exists);
            }
        }
        // Colocated without fusion: loop back over the network, always forward.
        direction = Direction::Forward;
        side = PumpSide::Source(output);
    }

    let map = side.map();
    if ctx.registry.contains(map, key) {
        if !kill_if_exists {
            return ConnectStatus::Success;
        }
        ctx.registry.cancel(map, key);
    }
    // Replacing connects may overlap; plain ones queue behind the first.
    let _dialing = if kill_if_exists {
        None
    } else {
        match ctx.registry.begin_dial(map, key) {
            Some(guard) => Some(guard),
            None => return ConnectStatus::ConnectionAdditionRace,
        }
    };

    let conn = match dial(ctx, &location).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(key = %key, addr = %location.address, port = location.port, error = %e, "dial failed");
            return ConnectStatus::ConnectionEstablishFailed;
        }
    };
    let request = ControlRequest::ConnectReceiver {
        key: key.clone(),
        direction,
        kill_if_exists: kill_remote,
    };
    hand_over(ctx, key, &request, side, conn, kill_if_exists).await
}

/// Sends `request` on a dialed connection and, once the peer accepts,
/// registers `side` and starts its pump.
async fn hand_over(
    ctx: &Arc<WorkerServices>,
    key: &ConnectionKey,
    request: &ControlRequest,
    side: PumpSide,
    mut conn: Connection,
    kill_if_exists: bool,
) -> ConnectStatus {
    let status = match exchange(&mut conn, request).await {
        Ok(status) => status,
        Err(e) => {
            warn!(key = %key, error = %e, "receiver handshake failed");
            return ConnectStatus::ConnectionEstablishFailed;
        }
    };
    let map = side.map();
    if !status.is_success() {
        ctx.pool.give_back(conn);
        if status == ConnectStatus::ServerRecovering
            && !kill_if_exists
            && ctx.registry.contains(map, key)
        {
            debug!(key = %key, "peer and local pump already serve the key");
            return ConnectStatus::Success;
        }
        return status;
    }

    let registration = if kill_if_exists {
        Some(ctx.registry.register_replacing(map, key))
    } else {
        ctx.registry.try_register(map, key)
    };
    let Some(registration) = registration else {
        // The peer is already pumping this stream; closing it ends that pump.
        debug!(key = %key, "lost registration race after remote accepted");
        drop(conn);
        return ConnectStatus::ConnectionAdditionRace;
    };
    pump::spawn_pump(
        ctx.clone(),
        PumpTask {
            key: key.clone(),
            registration,
            side,
        },
        conn,
    );
    ConnectStatus::Success
}

fn fuse(
    ctx: &Arc<WorkerServices>,
    key: &ConnectionKey,
    output: Arc<dyn FusableOutputEndpoint>,
    input: InputEndpoint,
    kill_if_exists: bool,
) -> ConnectStatus {
    let registration = if kill_if_exists {
        Some(ctx.registry.register_replacing(RegistryMap::Outbound, key))
    } else if ctx.registry.contains(RegistryMap::Outbound, key) {
        return ConnectStatus::Success;
    } else {
        ctx.registry.try_register(RegistryMap::Outbound, key)
    };
    let Some(registration) = registration else {
        return ConnectStatus::ConnectionAdditionRace;
    };
    ctx.metrics.inc_fused_connections();
    debug!(key = %key, "fusing colocated endpoints");
    pump::spawn_fused(ctx.clone(), key.clone(), registration, output, input);
    ConnectStatus::Success
}

async fn dial(
    ctx: &WorkerServices,
    location: &VertexLocation,
) -> vertexmesh_transport::Result<Connection> {
    if let Some(conn) = ctx.pool.try_borrow(&location.address, location.port).await {
        return Ok(conn);
    }
    let conn = ctx.tcp.connect(&location.address, location.port).await?;
    ctx.metrics.inc_connections_opened();
    secure_outbound(ctx.secure.as_ref(), conn, &location.instance).await
}

async fn exchange(
    conn: &mut Connection,
    request: &ControlRequest,
) -> vertexmesh_transport::Result<ConnectStatus> {
    request.write_to(&mut *conn).await?;
    read_status(&mut *conn).await
}

/// Answers a `CONNECT_RECEIVER` request on an accepted connection.
///
/// `direction` is `Forward` when this worker hosts the to vertex. Returns the
/// connection when it can serve further requests.
pub async fn connect_receiver_side(
    ctx: &Arc<WorkerServices>,
    mut conn: Connection,
    key: &ConnectionKey,
    direction: Direction,
    kill_if_exists: bool,
) -> Option<Connection> {
    let side = match direction {
        Direction::Forward => ctx
            .vertices
            .input(&key.to_vertex, &key.to_endpoint)
            .map(PumpSide::Sink),
        Direction::Reverse => ctx
            .vertices
            .output(&key.from_vertex, &key.from_endpoint)
            .map(PumpSide::Source),
    };
    let side = match side {
        Ok(side) => side,
        Err(status) => return reply(conn, key, status).await,
    };

    let map = side.map();
    let registration = if ctx.registry.contains(map, key) {
        if !kill_if_exists {
            return reply(conn, key, ConnectStatus::ServerRecovering).await;
        }
        Some(ctx.registry.register_replacing(map, key))
    } else {
        ctx.registry.try_register(map, key)
    };
    let Some(registration) = registration else {
        return reply(conn, key, ConnectStatus::ConnectionAdditionRace).await;
    };

    if let Err(e) = write_status(&mut conn, ConnectStatus::Success).await {
        debug!(key = %key, error = %e, "initiator went away before pumping");
        ctx.registry.remove_own(map, key, registration.id);
        return None;
    }
    debug!(key = %key, map = ?map, "receiver accepted connection");
    pump::run_accepted(
        ctx,
        PumpTask {
            key: key.clone(),
            registration,
            side,
        },
        conn,
    )
    .await
}

async fn reply(
    mut conn: Connection,
    key: &ConnectionKey,
    status: ConnectStatus,
) -> Option<Connection> {
    debug!(key = %key, %status, "receiver refused connection");
    match write_status(&mut conn, status).await {
        Ok(()) => Some(conn),
        Err(_) => None,
    }
}
