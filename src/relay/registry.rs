//! # Session Registry
//!
//! Process-wide lookup from session id to a handle for that session. The
//! registry never owns a session: in the service the handle is a weak actor
//! address, so a session that has stopped simply fails to upgrade. Entries
//! are removed when the session tears down.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug)]
pub struct SessionRegistry<H> {
    sessions: Mutex<HashMap<Uuid, H>>,
    capacity: usize,
}

impl<H: Clone> SessionRegistry<H> {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Add a session. Returns `false` when the registry is full.
    pub fn register(&self, id: Uuid, handle: H) -> bool {
        let mut sessions = self.lock();
        if sessions.len() >= self.capacity && !sessions.contains_key(&id) {
            return false;
        }
        sessions.insert(id, handle);
        true
    }

    /// Remove a session. Removing twice is harmless.
    pub fn remove(&self, id: &Uuid) -> Option<H> {
        self.lock().remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<H> {
        self.lock().get(id).cloned()
    }

    /// Copies of every handle, for broadcast-style dispatch (e.g. shutdown).
    pub fn handles(&self) -> Vec<H> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, H>> {
        // Entries are plain handles; a panic elsewhere cannot leave them half-written
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let registry = SessionRegistry::new(4);
        let id = Uuid::new_v4();

        assert!(registry.register(id, "a"));
        assert_eq!(registry.handles(), vec!["a"]);
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.remove(&id), Some("a"));
        assert_eq!(registry.remove(&id), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let registry = SessionRegistry::new(2);

        assert!(registry.register(Uuid::new_v4(), 1));
        assert!(registry.register(Uuid::new_v4(), 2));
        assert!(registry.is_full());
        assert!(!registry.register(Uuid::new_v4(), 3));
        assert_eq!(registry.handles().len(), 2);
    }
}
