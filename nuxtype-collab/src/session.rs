//! In-memory authority for one document's live collaborative state.
//!
//! ```text
//!   hydrate          join            last leave        close (flushed)
//! ──────────► Hydrated ──► Active ───────────► Draining ───────────► Evicted
//!                            ▲                    │
//!                            └──── join ──────────┘
//! ```
//!
//! All mutations of the document go through the state mutex, which is held
//! only around the merge and the broadcast send. Broadcasting under the lock
//! makes every receiver observe updates in the order they were applied.
//!
//! Persistence is driven by a per-session flusher task (see
//! [`crate::persistence`]). Dirtiness is tracked with two counters: the
//! number of applied edits and the edit count covered by the last stored
//! snapshot. An edit that lands while a snapshot is being written keeps the
//! session dirty.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::Identity;
use crate::broadcast::{BroadcastGroup, BroadcastStats, ClientId, Envelope};
use crate::config::PersistenceConfig;
use crate::crdt::{CrdtDocument, MergeError, YrsDocument};
use crate::error::CollabError;
use crate::persistence::{fetch_snapshot, run_flusher, store_with_retry};
use crate::protocol::{DocumentId, ProtocolError, SyncMessage};
use crate::storage::{SnapshotStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Loaded from the store (or empty), nobody joined yet
    Hydrated,
    /// At least one client connected
    Active,
    /// No clients left, final flush pending
    Draining,
    /// Flushed and removed from the registry
    Evicted,
}

/// What a client receives when it joins.
pub struct Joined {
    pub client_id: ClientId,
    /// Diff against the client's state vector, or the full state
    pub initial_sync: Vec<u8>,
    /// The session's state vector, so the client can send what we lack
    pub state_vector: Vec<u8>,
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
}

struct SessionState<D> {
    doc: D,
    clients: HashMap<ClientId, Identity>,
    phase: SessionPhase,
}

pub struct Session<D: CrdtDocument = YrsDocument> {
    document_id: DocumentId,
    state: Mutex<SessionState<D>>,
    broadcast: BroadcastGroup,
    store: Arc<dyn SnapshotStore>,
    config: PersistenceConfig,
    applied_version: AtomicU64,
    persisted_version: AtomicU64,
    degraded: AtomicBool,
    /// Serialises snapshot writes so an older snapshot never lands last
    flush_lock: Mutex<()>,
    flush_trigger: Arc<Notify>,
    flusher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<D: CrdtDocument> Session<D> {
    /// Load the document from `store` (empty on a miss) and start the
    /// session's flusher.
    ///
    /// A snapshot that the CRDT engine refuses is reported as
    /// [`CollabError::Hydration`]; nothing is written back to the store.
    pub async fn hydrate(
        document_id: DocumentId,
        store: Arc<dyn SnapshotStore>,
        config: PersistenceConfig,
        broadcast_capacity: usize,
    ) -> Result<Arc<Self>, CollabError> {
        let mut doc = D::empty();
        match fetch_snapshot(&store, &document_id).await? {
            Some(snapshot) => {
                doc.apply_update(&snapshot)
                    .map_err(|source| CollabError::Hydration {
                        document_id: document_id.clone(),
                        source,
                    })?;
                log::info!(
                    "Hydrated document {document_id} from a {} byte snapshot",
                    snapshot.len()
                );
            }
            None => log::info!("Document {document_id} not found in store, starting empty"),
        }

        let flush_trigger = Arc::new(Notify::new());
        let session = Arc::new(Self {
            document_id,
            state: Mutex::new(SessionState {
                doc,
                clients: HashMap::new(),
                phase: SessionPhase::Hydrated,
            }),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            store,
            config: config.clone(),
            applied_version: AtomicU64::new(0),
            persisted_version: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            flush_trigger: Arc::clone(&flush_trigger),
            flusher: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(run_flusher(Arc::downgrade(&session), flush_trigger, config));
        *session.flusher_slot() = Some(handle);
        Ok(session)
    }

    /// Add a client. `state_vector` is the client's own vector, if it sent
    /// one; a vector that fails to decode falls back to the full state.
    pub async fn join(&self, identity: Identity, state_vector: Option<&[u8]>) -> Joined {
        let client_id = Uuid::new_v4();
        let mut state = self.state.lock().await;

        let initial_sync = match state_vector {
            Some(sv) => match state.doc.diff_since(sv) {
                Ok(diff) => diff,
                Err(e) => {
                    log::warn!("Client {client_id} sent a bad state vector for {}: {e}", self.document_id);
                    state.doc.encode()
                }
            },
            None => state.doc.encode(),
        };
        let server_vector = state.doc.state_vector();
        let receiver = self.broadcast.subscribe();

        log::info!(
            "User {} joined document {} as client {client_id}",
            identity.user_id,
            self.document_id
        );
        state.clients.insert(client_id, identity);
        state.phase = SessionPhase::Active;

        Joined {
            client_id,
            initial_sync,
            state_vector: server_vector,
            receiver,
        }
    }

    /// Merge an update from `client_id` and relay it to everyone else.
    ///
    /// A rejected update leaves the document untouched and is not relayed.
    pub async fn apply_update(&self, client_id: ClientId, update: &[u8]) -> Result<(), MergeError> {
        let frame = SyncMessage::update(update.to_vec())
            .encode()
            .map_err(|e| MergeError::Rejected(e.to_string()))?;
        {
            let mut state = self.state.lock().await;
            state.doc.apply_update(update)?;
            self.applied_version.fetch_add(1, Ordering::SeqCst);
            self.broadcast.broadcast_raw(Some(client_id), frame);
        }
        log::trace!("Applied {} byte update from {client_id} to {}", update.len(), self.document_id);
        self.flush_trigger.notify_one();
        Ok(())
    }

    /// Relay ephemeral presence state. Never touches the document.
    pub fn relay_awareness(&self, client_id: ClientId, payload: &[u8]) -> Result<usize, ProtocolError> {
        self.broadcast
            .broadcast(Some(client_id), &SyncMessage::awareness(payload.to_vec()))
    }

    pub async fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        self.state.lock().await.doc.diff_since(state_vector)
    }

    pub async fn encode_state(&self) -> Vec<u8> {
        self.state.lock().await.doc.encode()
    }

    /// Remove a client. Returns the number of clients left.
    pub async fn leave(&self, client_id: ClientId) -> usize {
        let mut state = self.state.lock().await;
        if let Some(identity) = state.clients.remove(&client_id) {
            log::info!(
                "User {} (client {client_id}) left document {}",
                identity.user_id,
                self.document_id
            );
        }
        if state.clients.is_empty() && state.phase == SessionPhase::Active {
            state.phase = SessionPhase::Draining;
        }
        state.clients.len()
    }

    /// Write the current state if it changed since the last write.
    ///
    /// Returns `Ok(false)` when there was nothing to write.
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked().await
    }

    async fn flush_locked(&self) -> Result<bool, StoreError> {
        let (version, snapshot) = {
            let state = self.state.lock().await;
            let version = self.applied_version.load(Ordering::SeqCst);
            if version <= self.persisted_version.load(Ordering::SeqCst) {
                return Ok(false);
            }
            (version, state.doc.encode())
        };
        let size = snapshot.len();

        match store_with_retry(&self.store, &self.document_id, snapshot, &self.config).await {
            Ok(attempts) => {
                self.persisted_version.fetch_max(version, Ordering::SeqCst);
                if self.degraded.swap(false, Ordering::SeqCst) {
                    log::info!("Document {} is persisting again", self.document_id);
                }
                log::debug!(
                    "Persisted {size} byte snapshot of {} (attempts: {attempts})",
                    self.document_id
                );
                Ok(true)
            }
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                log::error!(
                    "ALERT: document {} could not be persisted after {} attempts, \
                     edits are held in memory only: {e}",
                    self.document_id,
                    self.config.retry_attempts.max(1)
                );
                Err(e)
            }
        }
    }

    /// Final flush, then stop the flusher and mark the session evicted.
    ///
    /// On a failed flush the session stays `Draining` with its flusher
    /// re-armed, so it is retried and stays resident.
    pub async fn close(&self) -> Result<(), StoreError> {
        let _guard = self.flush_lock.lock().await;
        if let Err(e) = self.flush_locked().await {
            self.flush_trigger.notify_one();
            return Err(e);
        }
        if let Some(handle) = self.flusher_slot().take() {
            handle.abort();
        }
        self.state.lock().await.phase = SessionPhase::Evicted;
        log::info!("Session for document {} evicted", self.document_id);
        Ok(())
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// Whether edits exist that no stored snapshot covers yet.
    pub fn is_dirty(&self) -> bool {
        self.applied_version.load(Ordering::SeqCst) > self.persisted_version.load(Ordering::SeqCst)
    }

    /// Whether the last flush exhausted its retries.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    /// Count frames a lagging client skipped.
    pub(crate) fn record_dropped(&self, skipped: u64) {
        self.broadcast.record_dropped(skipped);
    }

    fn flusher_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.flusher.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<D: CrdtDocument> Drop for Session<D> {
    fn drop(&mut self) {
        if let Some(handle) = self.flusher_slot().take() {
            handle.abort();
        }
    }
}
