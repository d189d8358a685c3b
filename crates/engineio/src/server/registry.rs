//! Session registry: register and look up live sockets by id.

use crate::socket::Socket;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live sockets keyed by session id, plus the id generator.
pub(crate) struct SessionRegistry {
    sessions: RwLock<HashMap<String, Socket>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Fresh session id; never repeats within one registry.
    pub(crate) fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    pub(crate) fn register(&self, socket: Socket) {
        let id = socket.id().to_string();
        if self.sessions.write().insert(id.clone(), socket).is_some() {
            log::warn!("session id {} registered twice", id);
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<Socket> {
        self.sessions.read().get(id).cloned()
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Socket> {
        self.sessions.write().remove(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Snapshot of every live socket. Callers act on it without the lock held.
    pub(crate) fn all(&self) -> Vec<Socket> {
        self.sessions.read().values().cloned().collect()
    }
}
