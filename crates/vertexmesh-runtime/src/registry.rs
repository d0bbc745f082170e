//! Live connection registry.
//!
//! Each worker keeps two maps from [`ConnectionKey`] to the pump currently
//! serving it: `Outbound` where this worker is the data source and `Inbound`
//! where it is the sink. At most one entry exists per key per map. Every
//! entry carries a unique id and a cancellation token; a pump removes only
//! the entry carrying its own id, so a replaced entry is never removed by the
//! pump it replaced.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vertexmesh_transport::ConnectionKey;

/// Which of the two maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryMap {
    /// This worker writes the connection's data.
    Outbound,
    /// This worker reads the connection's data.
    Inbound,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    id: u64,
    token: CancellationToken,
}

/// Proof of ownership handed to the pump that won a registration.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Unique entry id, used for [`ConnectionRegistry::remove_own`].
    pub id: u64,
    /// Fires when the entry is cancelled or the worker shuts down.
    pub token: CancellationToken,
}

/// The two live-connection maps of a worker.
#[derive(Debug)]
pub struct ConnectionRegistry {
    outbound: DashMap<ConnectionKey, RegistryEntry>,
    inbound: DashMap<ConnectionKey, RegistryEntry>,
    dialing: DashSet<(RegistryMap, ConnectionKey)>,
    next_id: AtomicU64,
    root: CancellationToken,
}

impl ConnectionRegistry {
    /// Empty registry whose entry tokens are children of `root`.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            outbound: DashMap::new(),
            inbound: DashMap::new(),
            dialing: DashSet::new(),
            next_id: AtomicU64::new(1),
            root,
        }
    }

    fn map(&self, map: RegistryMap) -> &DashMap<ConnectionKey, RegistryEntry> {
        match map {
            RegistryMap::Outbound => &self.outbound,
            RegistryMap::Inbound => &self.inbound,
        }
    }

    fn fresh_entry(&self) -> RegistryEntry {
        RegistryEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: self.root.child_token(),
        }
    }

    /// Inserts an entry for `key` unless one exists.
    ///
    /// `None` means another pump holds the key.
    pub fn try_register(&self, map: RegistryMap, key: &ConnectionKey) -> Option<Registration> {
        match self.map(map).entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let entry = self.fresh_entry();
                let registration = Registration {
                    id: entry.id,
                    token: entry.token.clone(),
                };
                slot.insert(entry);
                Some(registration)
            }
        }
    }

    /// Inserts an entry for `key`, cancelling whatever held it before.
    pub fn register_replacing(&self, map: RegistryMap, key: &ConnectionKey) -> Registration {
        let entry = self.fresh_entry();
        let registration = Registration {
            id: entry.id,
            token: entry.token.clone(),
        };
        if let Some(old) = self.map(map).insert(key.clone(), entry) {
            debug!(key = %key, map = ?map, old_id = old.id, "replacing live connection");
            old.token.cancel();
        }
        registration
    }

    /// Removes the entry for `key` only if it still carries `id`.
    ///
    /// Returns false when the entry was already cancelled or replaced.
    pub fn remove_own(&self, map: RegistryMap, key: &ConnectionKey, id: u64) -> bool {
        self.map(map).remove_if(key, |_, entry| entry.id == id).is_some()
    }

    /// Removes the entry for `key` and fires its token.
    pub fn cancel(&self, map: RegistryMap, key: &ConnectionKey) -> bool {
        match self.map(map).remove(key) {
            Some((_, entry)) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether `map` holds `key`.
    pub fn contains(&self, map: RegistryMap, key: &ConnectionKey) -> bool {
        self.map(map).contains_key(key)
    }

    /// Whether either map holds `key`.
    pub fn is_live(&self, key: &ConnectionKey) -> bool {
        self.outbound.contains_key(key) || self.inbound.contains_key(key)
    }

    /// Number of entries in `map`.
    pub fn len(&self, map: RegistryMap) -> usize {
        self.map(map).len()
    }

    /// Whether both maps are empty.
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }

    /// Sorted keys of `map`.
    pub fn keys(&self, map: RegistryMap) -> Vec<ConnectionKey> {
        let mut keys: Vec<_> = self.map(map).iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Marks a local handshake for `key` as in flight.
    ///
    /// `None` means another handshake for the same key and map is still
    /// running here. The mark clears when the guard drops.
    pub fn begin_dial(&self, map: RegistryMap, key: &ConnectionKey) -> Option<DialGuard<'_>> {
        let slot = (map, key.clone());
        if !self.dialing.insert(slot.clone()) {
            return None;
        }
        Some(DialGuard {
            registry: self,
            slot,
        })
    }

    /// Cancels and removes every entry in both maps.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for map in [RegistryMap::Outbound, RegistryMap::Inbound] {
            for key in self.keys(map) {
                if self.cancel(map, &key) {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }
}

/// In-flight handshake mark from [`ConnectionRegistry::begin_dial`].
#[derive(Debug)]
pub struct DialGuard<'a> {
    registry: &'a ConnectionRegistry,
    slot: (RegistryMap, ConnectionKey),
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.registry.dialing.remove(&self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key() -> ConnectionKey {
        ConnectionKey::new("a", "out", "b", "in")
    }

    #[test]
    fn test_register_is_exclusive_per_map() {
        let registry = ConnectionRegistry::new(CancellationToken::new());
        assert!(registry.try_register(RegistryMap::Outbound, &key()).is_some());
        assert!(registry.try_register(RegistryMap::Outbound, &key()).is_none());
        assert!(registry.try_register(RegistryMap::Inbound, &key()).is_some());
        assert_eq!(registry.len(RegistryMap::Outbound), 1);
        assert!(registry.is_live(&key()));
    }

    #[test]
    fn test_remove_own_ignores_replaced_entry() {
        let registry = ConnectionRegistry::new(CancellationToken::new());
        let first = registry.try_register(RegistryMap::Inbound, &key()).unwrap();
        let second = registry.register_replacing(RegistryMap::Inbound, &key());

        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert!(!registry.remove_own(RegistryMap::Inbound, &key(), first.id));
        assert!(registry.contains(RegistryMap::Inbound, &key()));
        assert!(registry.remove_own(RegistryMap::Inbound, &key(), second.id));
        assert!(!registry.remove_own(RegistryMap::Inbound, &key(), second.id));
    }

    #[test]
    fn test_cancel_fires_token() {
        let registry = ConnectionRegistry::new(CancellationToken::new());
        let reg = registry.try_register(RegistryMap::Outbound, &key()).unwrap();
        assert!(registry.cancel(RegistryMap::Outbound, &key()));
        assert!(reg.token.is_cancelled());
        assert!(!registry.cancel(RegistryMap::Outbound, &key()));
        assert!(!registry.remove_own(RegistryMap::Outbound, &key(), reg.id));
    }

    #[test]
    fn test_root_cancellation_reaches_entries() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new(root.clone());
        let reg = registry.try_register(RegistryMap::Outbound, &key()).unwrap();
        root.cancel();
        assert!(reg.token.is_cancelled());
    }

    #[test]
    fn test_cancel_all_empties_both_maps() {
        let registry = ConnectionRegistry::new(CancellationToken::new());
        let a = registry.try_register(RegistryMap::Outbound, &key()).unwrap();
        let b = registry
            .try_register(RegistryMap::Inbound, &ConnectionKey::new("x", "o", "y", "i"))
            .unwrap();
        assert_eq!(registry.cancel_all(), 2);
        assert!(registry.is_empty());
        assert!(a.token.is_cancelled() && b.token.is_cancelled());
    }

    #[test]
    fn test_concurrent_registration_has_one_winner() {
        let registry = Arc::new(ConnectionRegistry::new(CancellationToken::new()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .try_register(RegistryMap::Outbound, &key())
                        .is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_begin_dial_admits_one_handshake_per_key() {
        let registry = ConnectionRegistry::new(CancellationToken::new());
        let guard = registry.begin_dial(RegistryMap::Outbound, &key());
        assert!(guard.is_some());
        assert!(registry.begin_dial(RegistryMap::Outbound, &key()).is_none());
        assert!(registry.begin_dial(RegistryMap::Inbound, &key()).is_some());

        drop(guard);
        assert!(registry.begin_dial(RegistryMap::Outbound, &key()).is_some());
    }
}
