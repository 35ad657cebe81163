//! # nuxtype-collab - Real-time collaboration server for Nuxtype documents
//!
//! Hosts one in-memory CRDT session per open document, relays edits between
//! the WebSocket clients editing it, and writes debounced snapshots back to a
//! document store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket    ┌──────────────┐  get_or_create  ┌─────────────────┐
//! │ Y.js client │ ◄────────────► │ handler      │ ──────────────► │ SessionRegistry │
//! │ (per user)  │  Binary Proto  │ (per conn)   │                 │ (per doc slots) │
//! └─────────────┘                └──────┬───────┘                 └────────┬────────┘
//!                                       │ verify / can_access              │
//!                                       ▼                                  ▼
//!                                ┌──────────────┐                  ┌───────────────┐
//!                                │ JwtVerifier  │                  │ Session       │
//!                                │ AccessPolicy │                  │ Yrs Doc       │
//!                                └──────────────┘                  │ BroadcastGroup│
//!                                                                  └───────┬───────┘
//!                                                                          │ debounced flush
//!                                                                          ▼
//!                                                                  ┌───────────────┐
//!                                                                  │ SnapshotStore │
//!                                                                  └───────────────┘
//! ```
//!
//! ## Document owners
//!
//! Access is owner-only: [`DocumentStore`] and [`MemoryStore`] admit a user
//! to a document only when that user is its recorded owner. Owners are
//! written with [`DocumentStore::set_owner`] or imported in bulk from the
//! listing named by `COLLAB_OWNERS_FILE` (see [`parse_owners`]), which the
//! binary loads at startup. A RocksDB store keeps imported owners across
//! restarts, so the listing only has to carry additions. Until an owner is
//! recorded, every connection to that document is denied.
//!
//! ## Modules
//!
//! - [`protocol`]: Handshake parsing and binary wire protocol (bincode-encoded SyncMessage)
//! - [`auth`]: HS256 credential verification and document access policy
//! - [`crdt`]: CRDT capability trait, backed by yrs
//! - [`storage`]: Snapshot stores (in-memory, RocksDB)
//! - [`broadcast`]: Per-session fan-out with origin filtering
//! - [`persistence`]: Debounce window, retrying writes, flusher task
//! - [`session`]: Collaboration session state machine
//! - [`registry`]: Race-free session lifecycle per document id
//! - [`handler`]: Per-connection protocol handler
//! - [`server`]: WebSocket sync server

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod crdt;
pub mod error;
pub mod handler;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{
    sign_token, AccessPolicy, AllowAll, AuthError, Claims, CredentialVerifier, Identity,
    JwtVerifier,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, ClientId, Envelope};
pub use config::{parse_owners, read_owners, ConfigError, PersistenceConfig, ServerConfig};
pub use crdt::{CrdtDocument, MergeError, YrsDocument};
pub use error::CollabError;
pub use handler::ConnectionPhase;
pub use persistence::DebounceWindow;
pub use protocol::{DocumentId, Handshake, MessageType, ProtocolError, SyncMessage};
pub use registry::SessionRegistry;
pub use server::{ServerStats, SyncServer};
pub use session::{Joined, Session, SessionPhase};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, SnapshotStore, StoreConfig, StoreError,
};
