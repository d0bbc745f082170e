//! Reconciliation: drives live connections towards the desired graph.
//!
//! Startup restoration spawns one retry loop per desired connection touching
//! a hosted vertex. A pump that fails while still owning its registry entry
//! spawns the same loop. The loop runs until the key is live again, the
//! desired entry disappears, the worker shuts down, or the policy's attempt
//! bound is reached.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vertexmesh_transport::{ConnectStatus, ConnectionKey, Direction};

use crate::handshake::connect_initiator_side;
use crate::services::WorkerServices;

/// How the retry loop paces and escalates its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Sleep between attempts in milliseconds (default: 5000).
    pub backoff_ms: u64,
    /// Give up after this many attempts. `None` retries until the desired
    /// entry is removed or the worker stops.
    pub max_attempts: Option<u32>,
    /// After a `ServerRecovering` reply, ask the remote to kill its stale
    /// entry on later attempts (default: true).
    pub escalate_on_recovering: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_ms: 5000,
            max_attempts: None,
            escalate_on_recovering: true,
        }
    }
}

impl RetryPolicy {
    /// Sleep between attempts.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Why a retry loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// This loop's attempt re-established the connection.
    Restored,
    /// Someone else re-established it first.
    AlreadyLive,
    /// The desired entry was removed.
    NoLongerDesired,
    /// The attempt bound was reached.
    GaveUp,
    /// The worker is shutting down.
    Shutdown,
}

/// Retries `key` from this worker until it is live again or no longer wanted.
pub async fn retry_connection(
    ctx: &Arc<WorkerServices>,
    key: &ConnectionKey,
    direction: Direction,
) -> RetryOutcome {
    let policy = &ctx.retry;
    let mut kill_remote = false;
    let mut attempts = 0u32;
    loop {
        if ctx.shutdown.is_cancelled() {
            return RetryOutcome::Shutdown;
        }
        if ctx.registry.is_live(key) {
            debug!(key = %key, "connection already live, retry loop done");
            return RetryOutcome::AlreadyLive;
        }
        match ctx.metastore.connection_exists(key).await {
            Ok(false) => {
                debug!(key = %key, "connection no longer desired, retry loop done");
                return RetryOutcome::NoLongerDesired;
            }
            Ok(true) => {}
            Err(e) => warn!(key = %key, error = %e, "desired graph lookup failed, retrying anyway"),
        }

        attempts += 1;
        ctx.metrics.inc_retry_attempts();
        let status = connect_initiator_side(ctx, key, direction, kill_remote, false).await;
        match status {
            ConnectStatus::Success => {
                info!(key = %key, attempts, "connection restored");
                return RetryOutcome::Restored;
            }
            ConnectStatus::ServerRecovering if policy.escalate_on_recovering => {
                if !kill_remote {
                    debug!(key = %key, "remote holds a stale entry, escalating to kill");
                }
                kill_remote = true;
            }
            _ => {}
        }
        debug!(key = %key, %status, attempts, "connection attempt failed");

        if policy.exhausted(attempts) {
            warn!(key = %key, attempts, "giving up on connection");
            return RetryOutcome::GaveUp;
        }
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return RetryOutcome::Shutdown,
            _ = tokio::time::sleep(policy.backoff()) => {}
        }
    }
}

/// Spawns [`retry_connection`] as its own task.
pub fn spawn_retry(
    ctx: Arc<WorkerServices>,
    key: ConnectionKey,
    direction: Direction,
) -> JoinHandle<RetryOutcome> {
    tokio::spawn(async move { retry_connection(&ctx, &key, direction).await })
}

/// Spawns retry loops for every desired connection of `vertex`.
///
/// The vertex drives `Forward` where it is the from side and `Reverse`
/// where it is the to side.
pub async fn restore_vertex(ctx: &Arc<WorkerServices>, vertex: &str) -> Vec<JoinHandle<RetryOutcome>> {
    let mut handles = Vec::new();
    match ctx.metastore.connections_from(vertex).await {
        Ok(keys) => handles.extend(
            keys.into_iter()
                .map(|key| spawn_retry(ctx.clone(), key, Direction::Forward)),
        ),
        Err(e) => warn!(vertex = %vertex, error = %e, "cannot list outgoing connections"),
    }
    match ctx.metastore.connections_to(vertex).await {
        Ok(keys) => handles.extend(
            keys.into_iter()
                // A self-loop is already driven forward above.
                .filter(|key| key.from_vertex != vertex)
                .map(|key| spawn_retry(ctx.clone(), key, Direction::Reverse)),
        ),
        Err(e) => warn!(vertex = %vertex, error = %e, "cannot list incoming connections"),
    }
    handles
}

/// Spawns retry loops for every hosted vertex.
pub async fn restore_all(ctx: &Arc<WorkerServices>) -> Vec<JoinHandle<RetryOutcome>> {
    let mut handles = Vec::new();
    for vertex in ctx.vertices.names() {
        handles.extend(restore_vertex(ctx, &vertex).await);
    }
    info!(instance = %ctx.instance_name, restored = handles.len(), "startup restoration spawned");
    handles
}
