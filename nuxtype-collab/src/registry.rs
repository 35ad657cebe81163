//! Process-wide map from document id to its live session.
//!
//! Every document id gets a slot: a mutex around an optional session. All
//! lifecycle transitions for one document (create, join, release) run while
//! holding that slot, so two first-joins can never hydrate two sessions and
//! a release can never evict a session a concurrent join just re-populated.
//! Different documents only share the map lock, which is held for map edits
//! and never across an await on a slot or the store.
//!
//! A slot removed from the map while a caller was waiting for it is detected
//! by identity and the caller starts over with the current slot.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::auth::Identity;
use crate::broadcast::ClientId;
use crate::config::PersistenceConfig;
use crate::crdt::{CrdtDocument, YrsDocument};
use crate::error::CollabError;
use crate::protocol::DocumentId;
use crate::session::{Joined, Session};
use crate::storage::{SnapshotStore, StoreError};

type Slot<D> = Arc<Mutex<Option<Arc<Session<D>>>>>;
type SlotGuard<D> = OwnedMutexGuard<Option<Arc<Session<D>>>>;

pub struct SessionRegistry<D: CrdtDocument = YrsDocument> {
    slots: RwLock<HashMap<DocumentId, Slot<D>>>,
    store: Arc<dyn SnapshotStore>,
    config: PersistenceConfig,
    broadcast_capacity: usize,
}

impl<D: CrdtDocument> SessionRegistry<D> {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        config: PersistenceConfig,
        broadcast_capacity: usize,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            store,
            config,
            broadcast_capacity,
        }
    }

    /// Return the live session for `document_id`, hydrating it on first use.
    pub async fn get_or_create(&self, document_id: &DocumentId) -> Result<Arc<Session<D>>, CollabError> {
        let (slot, mut guard) = self.lock_slot(document_id).await;
        self.resident_or_hydrate(document_id, &slot, &mut guard).await
    }

    /// Get-or-create and join in one step, so the session cannot be released
    /// between the two.
    pub async fn join(
        &self,
        document_id: &DocumentId,
        identity: Identity,
        state_vector: Option<&[u8]>,
    ) -> Result<(Arc<Session<D>>, Joined), CollabError> {
        let (slot, mut guard) = self.lock_slot(document_id).await;
        let session = self.resident_or_hydrate(document_id, &slot, &mut guard).await?;
        let joined = session.join(identity, state_vector).await;
        Ok((session, joined))
    }

    /// Remove a client and release the session once it is empty.
    pub async fn leave(&self, session: &Arc<Session<D>>, client_id: ClientId) {
        if session.leave(client_id).await > 0 {
            return;
        }
        if let Err(e) = self.release(session.document_id()).await {
            log::warn!(
                "Keeping session {} resident, final flush failed: {e}",
                session.document_id()
            );
        }
    }

    /// Flush and evict the session if it has no clients.
    ///
    /// Returns `Ok(true)` if the session was evicted. A failed final flush
    /// leaves it registered so it can be retried.
    pub async fn release(&self, document_id: &DocumentId) -> Result<bool, StoreError> {
        let (slot, mut guard) = self.lock_slot(document_id).await;
        let Some(session) = (*guard).clone() else {
            self.retire(document_id, &slot).await;
            return Ok(false);
        };
        if session.client_count().await > 0 {
            return Ok(false);
        }

        session.close().await?;
        *guard = None;
        self.retire(document_id, &slot).await;
        Ok(true)
    }

    /// Retry release for every empty session (e.g. after a failed final
    /// flush). Returns the number evicted.
    pub async fn release_idle(&self) -> usize {
        let mut evicted = 0;
        for document_id in self.document_ids().await {
            match self.release(&document_id).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => log::warn!("Idle session {document_id} still not flushed: {e}"),
            }
        }
        evicted
    }

    /// Flush and evict every session regardless of connected clients.
    ///
    /// Returns the number of sessions whose final flush failed.
    pub async fn shutdown(&self) -> usize {
        let mut failed = 0;
        for document_id in self.document_ids().await {
            let (slot, mut guard) = self.lock_slot(&document_id).await;
            if let Some(session) = guard.take() {
                if let Err(e) = session.close().await {
                    log::error!("Lost unsaved edits of {document_id} on shutdown: {e}");
                    failed += 1;
                }
            }
            self.retire(&document_id, &slot).await;
        }
        log::info!("Session registry shut down ({failed} flush failures)");
        failed
    }

    /// The resident session for `document_id`, if any.
    pub async fn get(&self, document_id: &DocumentId) -> Option<Arc<Session<D>>> {
        let slot = self.slots.read().await.get(document_id).cloned()?;
        let guard = slot.lock().await;
        (*guard).clone()
    }

    /// Number of registered documents, including ones being hydrated.
    pub async fn session_count(&self) -> usize {
        self.slots.read().await.len()
    }

    async fn document_ids(&self) -> Vec<DocumentId> {
        self.slots.read().await.keys().cloned().collect()
    }

    async fn resident_or_hydrate(
        &self,
        document_id: &DocumentId,
        slot: &Slot<D>,
        guard: &mut SlotGuard<D>,
    ) -> Result<Arc<Session<D>>, CollabError> {
        if let Some(session) = &**guard {
            return Ok(Arc::clone(session));
        }

        match Session::hydrate(
            document_id.clone(),
            Arc::clone(&self.store),
            self.config.clone(),
            self.broadcast_capacity,
        )
        .await
        {
            Ok(session) => {
                **guard = Some(Arc::clone(&session));
                log::info!("Session created for document {document_id}");
                Ok(session)
            }
            Err(e) => {
                log::error!("Could not open document {document_id}: {e}");
                self.retire(document_id, slot).await;
                Err(e)
            }
        }
    }

    /// Lock the current slot for `document_id`, creating it if needed.
    async fn lock_slot(&self, document_id: &DocumentId) -> (Slot<D>, SlotGuard<D>) {
        loop {
            let slot = {
                let mut slots = self.slots.write().await;
                Arc::clone(slots.entry(document_id.clone()).or_default())
            };
            let guard = Arc::clone(&slot).lock_owned().await;

            let current = self
                .slots
                .read()
                .await
                .get(document_id)
                .is_some_and(|s| Arc::ptr_eq(s, &slot));
            if current {
                return (slot, guard);
            }
        }
    }

    /// Drop `slot` from the map if it is still the registered one.
    async fn retire(&self, document_id: &DocumentId, slot: &Slot<D>) {
        let mut slots = self.slots.write().await;
        if slots.get(document_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(document_id);
        }
    }
}
