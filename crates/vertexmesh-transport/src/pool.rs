//! Connection pool for reusing transport connections to peer workers.
//!
//! Idle connections are kept per `"address:port"`. A borrowed connection is
//! only handed out after it answers a `PING` with a zero status; anything
//! else discards it and the caller dials fresh. The lock is never held
//! across I/O, so each pool call is one short critical section.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connection::{pool_key, Connection};
use crate::metrics::TransportMetrics;

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum idle connections kept per peer (default: 4).
    pub max_connections_per_peer: usize,
    /// Time allowed for a liveness probe round-trip in milliseconds (default: 2000).
    pub probe_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_peer: 4,
            probe_timeout_ms: 2000,
        }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle connections across all peers.
    pub idle_connections: usize,
    /// Peers with at least one idle connection.
    pub peers: usize,
}

/// Process-wide pool of idle transport connections.
pub struct ConnectionPool {
    config: PoolConfig,
    idle: Mutex<HashMap<String, Vec<Connection>>>,
    metrics: Arc<TransportMetrics>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a new connection pool.
    pub fn new(config: PoolConfig, metrics: Arc<TransportMetrics>) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    fn pop(&self, key: &str) -> Option<Connection> {
        self.idle.lock().get_mut(key).and_then(Vec::pop)
    }

    /// Takes an idle connection to `address:port` that answers a probe.
    ///
    /// Candidates failing their probe are closed and the next one is tried.
    /// Returns `None` when no pooled connection is usable.
    pub async fn try_borrow(&self, address: &str, port: u16) -> Option<Connection> {
        let key = pool_key(address, port);
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        while let Some(mut conn) = self.pop(&key) {
            match conn.ping(timeout).await {
                Ok(()) => {
                    self.metrics.inc_pool_hits();
                    debug!(addr = %key, "reusing pooled connection");
                    return Some(conn);
                }
                Err(e) => {
                    self.metrics.inc_pool_discards();
                    debug!(addr = %key, error = %e, "discarding stale pooled connection");
                }
            }
        }
        self.metrics.inc_pool_misses();
        None
    }

    /// Returns a connection for reuse. Connections beyond the per-peer bound
    /// are closed.
    pub fn give_back(&self, conn: Connection) {
        let key = conn.pool_key();
        let mut idle = self.idle.lock();
        let slot = idle.entry(key).or_default();
        if slot.len() < self.config.max_connections_per_peer {
            slot.push(conn);
            self.metrics.inc_pool_returns();
        } else {
            drop(idle);
            self.metrics.inc_pool_overflow();
            drop(conn);
        }
    }

    /// Closes every idle connection to a peer, returning how many were dropped.
    pub fn remove_peer(&self, address: &str, port: u16) -> usize {
        self.idle
            .lock()
            .remove(&pool_key(address, port))
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Closes every idle connection.
    pub fn clear(&self) {
        self.idle.lock().clear();
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock();
        PoolStats {
            idle_connections: idle.values().map(Vec::len).sum(),
            peers: idle.values().filter(|v| !v.is_empty()).count(),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::protocol::{write_status, ConnectStatus, Opcode};
    use tokio::io::DuplexStream;

    fn pool(max: usize) -> (ConnectionPool, Arc<TransportMetrics>) {
        let metrics = Arc::new(TransportMetrics::new());
        let config = PoolConfig {
            max_connections_per_peer: max,
            probe_timeout_ms: 500,
        };
        (ConnectionPool::new(config, metrics.clone()), metrics)
    }

    fn pair(address: &str, port: u16) -> (Connection, DuplexStream) {
        let (a, b) = tokio::io::duplex(256);
        (Connection::new(Box::new(a), address, port), b)
    }

    async fn answer_ping(mut peer: DuplexStream, status: ConnectStatus) -> DuplexStream {
        let op = codec::read_i32(&mut peer).await.unwrap();
        assert_eq!(op, Opcode::Ping as i32);
        write_status(&mut peer, status).await.unwrap();
        peer
    }

    #[tokio::test]
    async fn test_borrow_from_empty_pool() {
        let (pool, metrics) = pool(4);
        assert!(pool.try_borrow("10.0.0.1", 1500).await.is_none());
        assert_eq!(metrics.snapshot().pool_misses, 1);
    }

    #[tokio::test]
    async fn test_borrow_live_connection() {
        let (pool, metrics) = pool(4);
        let (conn, peer) = pair("10.0.0.1", 1500);
        pool.give_back(conn);
        assert_eq!(pool.stats().idle_connections, 1);

        let responder = tokio::spawn(answer_ping(peer, ConnectStatus::Success));
        let borrowed = pool.try_borrow("10.0.0.1", 1500).await;
        assert!(borrowed.is_some());
        assert_eq!(metrics.snapshot().pool_hits, 1);
        assert_eq!(pool.stats().idle_connections, 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_probe_discards() {
        let (pool, metrics) = pool(4);
        let (conn, peer) = pair("10.0.0.1", 1500);
        pool.give_back(conn);

        let responder = tokio::spawn(answer_ping(peer, ConnectStatus::ServerRecovering));
        assert!(pool.try_borrow("10.0.0.1", 1500).await.is_none());
        assert_eq!(metrics.snapshot().pool_discards, 1);
        assert_eq!(pool.stats().idle_connections, 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_candidate_skipped_for_live_one() {
        let (pool, metrics) = pool(4);
        let (live, live_peer) = pair("10.0.0.3", 1500);
        let (stale, stale_peer) = pair("10.0.0.3", 1500);
        pool.give_back(live);
        pool.give_back(stale);
        drop(stale_peer);

        let responder = tokio::spawn(answer_ping(live_peer, ConnectStatus::Success));
        assert!(pool.try_borrow("10.0.0.3", 1500).await.is_some());
        let snap = metrics.snapshot();
        assert_eq!(snap.pool_discards, 1);
        assert_eq!(snap.pool_hits, 1);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_discards() {
        let (pool, _) = pool(4);
        let (conn, peer) = pair("10.0.0.1", 1500);
        drop(peer);
        pool.give_back(conn);
        assert!(pool.try_borrow("10.0.0.1", 1500).await.is_none());
    }

    #[tokio::test]
    async fn test_give_back_is_bounded() {
        let (pool, metrics) = pool(2);
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (conn, peer) = pair("10.0.0.2", 1500);
            peers.push(peer);
            pool.give_back(conn);
        }
        assert_eq!(pool.stats().idle_connections, 2);
        assert_eq!(metrics.snapshot().pool_overflow, 1);
    }

    #[tokio::test]
    async fn test_keys_are_per_address_and_port() {
        let (pool, _) = pool(4);
        let (c1, _p1) = pair("10.0.0.1", 1500);
        let (c2, _p2) = pair("10.0.0.1", 1501);
        pool.give_back(c1);
        pool.give_back(c2);
        assert_eq!(pool.stats(), PoolStats { idle_connections: 2, peers: 2 });
        assert_eq!(pool.remove_peer("10.0.0.1", 1500), 1);
        assert!(pool.try_borrow("10.0.0.1", 1500).await.is_none());
        pool.clear();
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
