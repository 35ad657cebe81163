//! Persistence of per-document CRDT snapshots.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  debounced flush  ┌──────────────┐
//! │ Session     │ ────────────────► │ SnapshotStore│
//! │ (in-memory) │                   │              │
//! └──────┬──────┘                   └──────┬───────┘
//!        │                                 │
//!        │ first join (hydrate)            ├── MemoryStore (process-local)
//!        ▼                                 └── DocumentStore (RocksDB)
//! ┌─────────────┐                              ├── CF "snapshots" (LZ4)
//! │ Yrs Doc     │                              ├── CF "metadata"
//! │ (restored)  │                              └── CF "owners"
//! └─────────────┘
//! ```
//!
//! A store replaces a document's snapshot atomically: readers observe
//! either the previous snapshot or the new one, never a partial write.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

use thiserror::Error;

use crate::protocol::DocumentId;

/// Storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("compression error: {0}")]
    CompressionError(String),
    /// The store could not be reached (blocking task failed, backend down)
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value persistence of binary document snapshots.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Latest snapshot for `document_id`, or `None` if it was never stored.
    fn fetch(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically replace the snapshot for `document_id`.
    fn store(&self, document_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError>;
}
