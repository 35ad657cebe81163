//! Debounced write-back of session state.
//!
//! Every session owns one flusher task. Edits poke the task through a
//! [`Notify`]; the task then waits for a quiet period (`debounce`) but never
//! longer than `max_debounce` after the first unsaved edit, and writes one
//! snapshot for the whole burst. A failed flush re-arms the task, so a
//! degraded session keeps retrying on the same schedule while editing goes
//! on in memory.

use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::PersistenceConfig;
use crate::crdt::CrdtDocument;
use crate::protocol::DocumentId;
use crate::session::Session;
use crate::storage::{SnapshotStore, StoreError};

/// Flush deadline for one burst of edits.
#[derive(Debug, Clone, Copy)]
pub struct DebounceWindow {
    first_dirty: Instant,
    debounce: std::time::Duration,
    max_debounce: std::time::Duration,
}

impl DebounceWindow {
    pub fn open(first_dirty: Instant, config: &PersistenceConfig) -> Self {
        Self {
            first_dirty,
            debounce: config.debounce,
            max_debounce: config.max_debounce,
        }
    }

    /// The earlier of "quiet since `last_edit`" and the staleness bound.
    pub fn deadline(&self, last_edit: Instant) -> Instant {
        (last_edit + self.debounce).min(self.first_dirty + self.max_debounce)
    }
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(StoreError::Unavailable(e.to_string())))
}

pub(crate) async fn fetch_snapshot(
    store: &Arc<dyn SnapshotStore>,
    document_id: &DocumentId,
) -> Result<Option<Vec<u8>>, StoreError> {
    let store = Arc::clone(store);
    let id = document_id.clone();
    blocking(move || store.fetch(&id)).await
}

/// Write `snapshot`, retrying with exponential backoff.
///
/// Returns the number of attempts used on success.
pub(crate) async fn store_with_retry(
    store: &Arc<dyn SnapshotStore>,
    document_id: &DocumentId,
    snapshot: Vec<u8>,
    config: &PersistenceConfig,
) -> Result<u32, StoreError> {
    let snapshot = Arc::new(snapshot);
    let attempts = config.retry_attempts.max(1);
    let mut backoff = config.retry_backoff;

    let mut attempt = 1;
    loop {
        let store = Arc::clone(store);
        let id = document_id.clone();
        let bytes = Arc::clone(&snapshot);
        match blocking(move || store.store(&id, &bytes)).await {
            Ok(()) => return Ok(attempt),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                log::warn!(
                    "Snapshot write for {document_id} failed (attempt {attempt}/{attempts}): {e}"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

/// Body of a session's flusher task.
///
/// Holds only a weak reference so a dropped session takes its task down.
pub(crate) async fn run_flusher<D: CrdtDocument>(
    session: Weak<Session<D>>,
    trigger: Arc<Notify>,
    config: PersistenceConfig,
) {
    loop {
        trigger.notified().await;

        let first_dirty = Instant::now();
        let window = DebounceWindow::open(first_dirty, &config);
        let mut last_edit = first_dirty;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(window.deadline(last_edit)) => break,
                _ = trigger.notified() => last_edit = Instant::now(),
            }
        }

        let Some(session) = session.upgrade() else {
            return;
        };
        if session.flush().await.is_err() {
            trigger.notify_one();
        }
    }
}
