//! Nuxtype collaboration server.
//!
//! Configured from the environment (`JWT_SECRET` is required; see
//! [`ServerConfig::from_env`]). With `COLLAB_STORAGE_PATH` set, snapshots
//! and document owners live in RocksDB; otherwise everything is kept in
//! memory for the lifetime of the process.
//!
//! Only a document's owner may open it. Owners listed in
//! `COLLAB_OWNERS_FILE` are imported at startup, and imports accumulate in
//! the RocksDB `owners` table across restarts. A RocksDB deployment with no
//! owners recorded denies every document. In memory mode without a listing,
//! any verified user may edit.

use std::process::ExitCode;
use std::sync::Arc;

use nuxtype_collab::{
    read_owners, AccessPolicy, AllowAll, CollabError, DocumentStore, JwtVerifier, MemoryStore,
    ServerConfig, SnapshotStore, StoreConfig, SyncServer,
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Collaboration server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), CollabError> {
    let verifier = Arc::new(JwtVerifier::new(config.jwt_secret.as_bytes()));

    let owners = match &config.owners_file {
        Some(path) => {
            let owners = read_owners(path)?;
            log::info!("Loaded {} document owners from {}", owners.len(), path.display());
            Some(owners)
        }
        None => None,
    };

    let (store, policy): (Arc<dyn SnapshotStore>, Arc<dyn AccessPolicy>) =
        match &config.storage_path {
            Some(path) => {
                let store = Arc::new(DocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?);
                if let Some(owners) = &owners {
                    store.import_owners(owners)?;
                }
                log::info!(
                    "Persisting documents to {} ({} stored)",
                    path.display(),
                    store.list_documents()?.len()
                );
                (store.clone() as Arc<dyn SnapshotStore>, store as Arc<dyn AccessPolicy>)
            }
            None => {
                log::warn!("No COLLAB_STORAGE_PATH set, documents are kept in memory only");
                let store = Arc::new(MemoryStore::new());
                match owners {
                    Some(owners) => {
                        for (document_id, user_id) in owners {
                            store.set_owner(&document_id, user_id);
                        }
                        (store.clone() as Arc<dyn SnapshotStore>, store as Arc<dyn AccessPolicy>)
                    }
                    // No owners to check against: any verified user may edit
                    None => (
                        store as Arc<dyn SnapshotStore>,
                        Arc::new(AllowAll) as Arc<dyn AccessPolicy>,
                    ),
                }
            }
        };

    let server: SyncServer = SyncServer::new(config, verifier, policy, store);
    server.run().await
}
