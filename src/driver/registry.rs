// SPDX-License-Identifier: Apache-2.0

use crate::driver::session::Session;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Directory of live sessions, keyed both by stream path and by container
/// identity. Both maps sit behind one reader/writer lock so store and delete
/// touch them atomically with respect to concurrent lookups; no operation
/// does I/O under the lock.
pub(crate) struct SessionRegistry {
    inner: RwLock<Maps>,
}

#[derive(Default)]
struct Maps {
    by_path: HashMap<String, Arc<Session>>,
    by_container: HashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(Maps::default()),
        }
    }

    pub(crate) fn load_by_path(&self, path: &str) -> Option<Arc<Session>> {
        let maps = self.inner.read().unwrap_or_else(|e| e.into_inner());
        maps.by_path.get(path).cloned()
    }

    pub(crate) fn load_by_container(&self, container_id: &str) -> Option<Arc<Session>> {
        let maps = self.inner.read().unwrap_or_else(|e| e.into_inner());
        maps.by_container.get(container_id).cloned()
    }

    /// Registers the session under both keys. Returns false, without
    /// touching either map, when one of the keys is already taken.
    pub(crate) fn store(&self, path: &str, container_id: &str, session: Arc<Session>) -> bool {
        let mut maps = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if maps.by_path.contains_key(path) || maps.by_container.contains_key(container_id) {
            return false;
        }
        maps.by_path.insert(path.to_string(), session.clone());
        maps.by_container.insert(container_id.to_string(), session);
        true
    }

    pub(crate) fn delete(&self, path: &str, container_id: &str) {
        let mut maps = self.inner.write().unwrap_or_else(|e| e.into_inner());
        maps.by_path.remove(path);
        maps.by_container.remove(container_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::session::tests::test_session;

    #[tokio::test]
    async fn store_load_delete() {
        let registry = SessionRegistry::new();
        let session = test_session("abc123").await;

        assert!(registry.store("/run/fifo1", "abc123", session));

        assert!(registry.load_by_path("/run/fifo1").is_some());
        assert!(registry.load_by_container("abc123").is_some());
        assert!(registry.load_by_path("/run/other").is_none());

        registry.delete("/run/fifo1", "abc123");
        assert!(registry.load_by_path("/run/fifo1").is_none());
        assert!(registry.load_by_container("abc123").is_none());
    }

    #[tokio::test]
    async fn duplicate_keys_are_rejected_without_mutation() {
        let registry = SessionRegistry::new();
        assert!(registry.store("/run/fifo1", "abc123", test_session("abc123").await));

        // Same path, different container.
        assert!(!registry.store("/run/fifo1", "other", test_session("other").await));
        assert!(registry.load_by_container("other").is_none());

        // Different path, same container.
        assert!(!registry.store("/run/fifo2", "abc123", test_session("abc123").await));
        assert!(registry.load_by_path("/run/fifo2").is_none());
    }
}
