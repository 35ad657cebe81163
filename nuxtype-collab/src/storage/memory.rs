//! Process-local snapshot store.
//!
//! Used when the server runs without a storage path, and by tests. Owners
//! registered with [`MemoryStore::set_owner`] back its [`AccessPolicy`]
//! implementation exactly like the RocksDB store's owners table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{SnapshotStore, StoreError};
use crate::auth::{AccessPolicy, Identity};
use crate::protocol::DocumentId;

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<DocumentId, Vec<u8>>>,
    owners: RwLock<HashMap<DocumentId, String>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owner(&self, document_id: &DocumentId, user_id: impl Into<String>) {
        self.owners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document_id.clone(), user_id.into());
    }

    /// Number of successful `store` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn document_count(&self) -> usize {
        self.snapshots.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl SnapshotStore for MemoryStore {
    fn fetch(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_id)
            .cloned())
    }

    fn store(&self, document_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document_id.clone(), snapshot.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl AccessPolicy for MemoryStore {
    fn can_access(&self, identity: &Identity, document_id: &DocumentId) -> bool {
        self.owners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_id)
            .is_some_and(|owner| *owner == identity.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> DocumentId {
        DocumentId::parse(id).unwrap()
    }

    #[test]
    fn test_fetch_missing_is_none() {
        let store = MemoryStore::new();
        assert_eq!(store.fetch(&doc("nope")).unwrap(), None);
    }

    #[test]
    fn test_store_replaces_snapshot() {
        let store = MemoryStore::new();
        let id = doc("doc1");
        store.store(&id, b"first").unwrap();
        store.store(&id, b"second").unwrap();
        assert_eq!(store.fetch(&id).unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.document_count(), 1);
    }

    #[test]
    fn test_owner_policy() {
        let store = MemoryStore::new();
        let id = doc("doc1");
        let alice = Identity {
            user_id: "alice".into(),
            email: "alice@example.com".into(),
        };
        let bob = Identity {
            user_id: "bob".into(),
            email: "bob@example.com".into(),
        };

        assert!(!store.can_access(&alice, &id));
        store.set_owner(&id, "alice");
        assert!(store.can_access(&alice, &id));
        assert!(!store.can_access(&bob, &id));
    }
}
