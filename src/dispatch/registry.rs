use std::collections::HashMap;
use std::sync::Arc;

use crate::network::{Connection, UNREGISTERED};

/// Live connections by id.
///
/// Owned by the dispatcher and never shared, so it needs no locking. Ids come
/// from a counter that only grows, a removed id is never handed out again.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: HashMap<u64, Arc<Connection>>,
    last_id: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Assigns the next id to `conn` and records it.
    pub fn register(&mut self, conn: Arc<Connection>) -> u64 {
        self.last_id += 1;
        let id = self.last_id;
        conn.set_id(id);
        self.conns.insert(id, conn);
        id
    }

    /// Removes `conn`, no-op if it was never registered or is already gone.
    pub fn remove(&mut self, conn: &Arc<Connection>) -> Option<Arc<Connection>> {
        let id = conn.id();
        if id == UNREGISTERED {
            return None;
        }
        match self.conns.get(&id) {
            Some(registered) if Arc::ptr_eq(registered, conn) => self.conns.remove(&id),
            _ => None,
        }
    }

    pub fn get(&self, id: u64) -> Option<&Arc<Connection>> {
        self.conns.get(&id)
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.conns.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Empties the registry, handing back every connection it held.
    pub fn drain(&mut self) -> Vec<Arc<Connection>> {
        self.conns.drain().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
