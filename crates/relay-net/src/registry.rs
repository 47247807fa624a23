//! Server-side connection registry and identifier generation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::connection::{Connection, ConnectionId};

/// Source of identifiers for accepted connections.
///
/// Injected into the server so tests can use a deterministic sequence.
pub trait IdGenerator: Send + Sync {
    /// Return the next identifier.
    fn next_id(&self) -> ConnectionId;
}

/// Monotonically increasing identifiers.
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a generator whose first identifier is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Uniformly random identifiers, never [`ConnectionId::CLIENT`].
#[derive(Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_id(&self) -> ConnectionId {
        loop {
            let id = rand::random::<u64>();
            if id != ConnectionId::CLIENT.0 {
                return ConnectionId(id);
            }
        }
    }
}

/// The identifier is already registered.
#[derive(Debug, thiserror::Error)]
#[error("connection {0} is already registered")]
pub struct DuplicateId(pub ConnectionId);

/// Thread-safe map of open connections keyed by [`ConnectionId`].
///
/// Closed connections never outlive an observation: every lookup evicts a
/// closed entry instead of returning it, and [`ConnectionRegistry::remove`]
/// closes the connection while its map entry is still locked.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` under its own identifier.
    pub fn insert(&self, connection: Arc<Connection>) -> Result<(), DuplicateId> {
        match self.inner.entry(connection.id()) {
            Entry::Occupied(entry) if entry.get().is_open() => Err(DuplicateId(connection.id())),
            Entry::Occupied(mut entry) => {
                entry.insert(connection);
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(connection);
                Ok(())
            }
        }
    }

    /// Whether `id` is registered (open or not yet evicted).
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.contains_key(&id)
    }

    /// Look up an open connection. A closed entry is evicted and reported absent.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let connection = self.inner.get(&id).map(|entry| Arc::clone(entry.value()))?;
        if connection.is_open() {
            Some(connection)
        } else {
            self.evict_if_same(&connection);
            None
        }
    }

    /// Close and remove `id`. Returns the removed connection.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner
            .remove_if(&id, |_, connection| {
                connection.close();
                true
            })
            .map(|(_, connection)| connection)
    }

    /// Remove `connection` only if it is still the entry registered under its
    /// identifier, closing it. Returns whether it was removed.
    pub fn evict_if_same(&self, connection: &Arc<Connection>) -> bool {
        self.inner
            .remove_if(&connection.id(), |_, registered| {
                if Arc::ptr_eq(registered, connection) {
                    registered.close();
                    true
                } else {
                    false
                }
            })
            .is_some()
    }

    /// Snapshot of every open connection. Closed entries are evicted.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.purge_closed();
        self.inner
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Identifiers of every open connection, sorted.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.purge_closed();
        let mut ids: Vec<_> = self.inner.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Close and remove every connection. Returns how many were removed.
    pub fn close_all(&self) -> usize {
        let mut removed = 0;
        self.inner.retain(|_, connection| {
            connection.close();
            removed += 1;
            false
        });
        removed
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.purge_closed();
        self.inner.len()
    }

    /// Whether there are no open connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_closed(&self) {
        self.inner.retain(|_, connection| connection.is_open());
    }
}
