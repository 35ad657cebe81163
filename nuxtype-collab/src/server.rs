//! WebSocket sync server with per-document session routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── Session (doc1) ── Yrs Doc ── BroadcastGroup
//!            ├── handler ──────┤        │
//! Client B ──┘   (auth, relay) │        └── flusher ──► SnapshotStore
//!                              │                          ├── MemoryStore
//! Client C ────── handler ─────┴── Session (doc2)         └── DocumentStore (RocksDB)
//! ```
//!
//! The server owns the session registry for its whole lifetime: it starts
//! empty, gains a session per opened document, and is flushed in full when
//! the server stops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::auth::{AccessPolicy, CredentialVerifier};
use crate::config::ServerConfig;
use crate::crdt::{CrdtDocument, YrsDocument};
use crate::error::CollabError;
use crate::handler::{handle_connection, ConnectionContext};
use crate::registry::SessionRegistry;
use crate::storage::SnapshotStore;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Upgrades refused and connections denied at authentication
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub active_sessions: usize,
}

/// The sync server.
pub struct SyncServer<D: CrdtDocument = YrsDocument> {
    config: ServerConfig,
    registry: Arc<SessionRegistry<D>>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    verifier: Arc<dyn CredentialVerifier>,
    policy: Arc<dyn AccessPolicy>,
}

impl<D: CrdtDocument> SyncServer<D> {
    pub fn new(
        config: ServerConfig,
        verifier: Arc<dyn CredentialVerifier>,
        policy: Arc<dyn AccessPolicy>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            store,
            config.persistence.clone(),
            config.broadcast_capacity,
        ));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            verifier,
            policy,
        }
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            log::info!("Shutdown signal received");
        })
        .await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// flush every session.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), CollabError>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let ctx = Arc::new(ConnectionContext {
            registry: Arc::clone(&self.registry),
            verifier: Arc::clone(&self.verifier),
            policy: Arc::clone(&self.policy),
            stats: Arc::clone(&self.stats),
            initial_sync_timeout: self.config.initial_sync_timeout,
            max_protocol_violations: self.config.max_protocol_violations,
        });
        let sweeper = self.spawn_idle_sweep();

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            break Err(e.into());
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    Self::spawn_connection(stream, addr, Arc::clone(&ctx));
                }
            }
        };

        sweeper.abort();
        let failed = self.registry.shutdown().await;
        if failed > 0 {
            log::error!("{failed} documents could not be flushed on shutdown");
        }
        result
    }

    fn spawn_connection(
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
        ctx: Arc<ConnectionContext<D>>,
    ) {
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, ctx).await {
                match e {
                    CollabError::Transport(_) | CollabError::Protocol(_) => {
                        log::warn!("Connection from {addr} ended: {e}")
                    }
                    _ => log::error!("Connection error from {addr}: {e}"),
                }
            }
        });
    }

    /// Periodically evict empty sessions whose final flush failed earlier.
    fn spawn_idle_sweep(&self) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = registry.release_idle().await;
                if evicted > 0 {
                    log::info!("Idle sweep evicted {evicted} sessions");
                }
                stats.write().await.active_sessions = registry.session_count().await;
            }
        })
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.registry.session_count().await;
        stats
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<D>> {
        &self.registry
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
