//! Transport and connection-lifecycle metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Transport connections dialed.
    pub connections_opened: u64,
    /// Transport connections accepted.
    pub connections_accepted: u64,
    /// Pooled connections that passed their probe and were handed out.
    pub pool_hits: u64,
    /// Borrow attempts that found nothing pooled.
    pub pool_misses: u64,
    /// Pooled connections dropped after a failed probe.
    pub pool_discards: u64,
    /// Connections returned to the pool.
    pub pool_returns: u64,
    /// Connections closed because the pool was full.
    pub pool_overflow: u64,
    /// Handshakes that ended in `Success`.
    pub handshakes_succeeded: u64,
    /// Handshakes that ended in any other status.
    pub handshakes_failed: u64,
    /// Fused in-process connections started.
    pub fused_connections: u64,
    /// Pumps that ran to completion.
    pub pumps_completed: u64,
    /// Pumps stopped by their cancellation token.
    pub pumps_cancelled: u64,
    /// Pumps that failed and handed over to reconciliation.
    pub pumps_failed: u64,
    /// Reconciliation attempts made.
    pub retry_attempts: u64,
}

/// Thread-safe transport layer metrics collector.
#[derive(Default)]
pub struct TransportMetrics {
    connections_opened: AtomicU64,
    connections_accepted: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    pool_discards: AtomicU64,
    pool_returns: AtomicU64,
    pool_overflow: AtomicU64,
    handshakes_succeeded: AtomicU64,
    handshakes_failed: AtomicU64,
    fused_connections: AtomicU64,
    pumps_completed: AtomicU64,
    pumps_cancelled: AtomicU64,
    pumps_failed: AtomicU64,
    retry_attempts: AtomicU64,
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increments `", stringify!($field), "`.")]
            pub fn $inc(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl TransportMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        inc_connections_opened => connections_opened,
        inc_connections_accepted => connections_accepted,
        inc_pool_hits => pool_hits,
        inc_pool_misses => pool_misses,
        inc_pool_discards => pool_discards,
        inc_pool_returns => pool_returns,
        inc_pool_overflow => pool_overflow,
        inc_handshakes_succeeded => handshakes_succeeded,
        inc_handshakes_failed => handshakes_failed,
        inc_fused_connections => fused_connections,
        inc_pumps_completed => pumps_completed,
        inc_pumps_cancelled => pumps_cancelled,
        inc_pumps_failed => pumps_failed,
        inc_retry_attempts => retry_attempts,
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            pool_discards: self.pool_discards.load(Ordering::Relaxed),
            pool_returns: self.pool_returns.load(Ordering::Relaxed),
            pool_overflow: self.pool_overflow.load(Ordering::Relaxed),
            handshakes_succeeded: self.handshakes_succeeded.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            fused_connections: self.fused_connections.load(Ordering::Relaxed),
            pumps_completed: self.pumps_completed.load(Ordering::Relaxed),
            pumps_cancelled: self.pumps_cancelled.load(Ordering::Relaxed),
            pumps_failed: self.pumps_failed.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
        }
    }
}
