//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `snapshots`: Full CRDT document snapshots (LZ4 compressed)
//! - `metadata`: Per-document bookkeeping (bincode: sizes, flush count, timestamps)
//! - `owners`: Owning user id per document, consulted for authorization
//!
//! Snapshot and metadata are written in one `WriteBatch`, so a crash
//! mid-flush leaves the previous snapshot intact.
//!
//! Reference: Kleppmann - DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{SnapshotStore, StoreError};
use crate::auth::{unix_now, AccessPolicy, Identity};
use crate::protocol::DocumentId;

/// Column family names.
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";
const CF_OWNERS: &str = "owners";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA, CF_OWNERS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Fsync every snapshot write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("nuxtype_collab_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: String,
    /// Number of snapshots written so far
    pub flush_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: &DocumentId) -> Self {
        let now = unix_now();
        Self {
            document_id: document_id.to_string(),
            flush_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode - concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the document store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Values are LZ4-compressed already
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA | CF_OWNERS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full document snapshot (LZ4 compressed), replacing the previous one.
    pub fn save_snapshot(
        &self,
        document_id: &DocumentId,
        snapshot: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(document_id));
        meta.flush_count += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let key = document_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, key, &compressed);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load a document snapshot (LZ4 decompressed).
    pub fn load_snapshot(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(&cf, document_id.as_bytes())?
            .map(|bytes| DocumentMetadata::decode(&bytes))
            .transpose()
    }

    /// List all document ids that have a snapshot.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let raw = std::str::from_utf8(&key)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            let id = DocumentId::parse(raw)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(id);
        }

        Ok(ids)
    }

    // ─── Owners ───────────────────────────────────────────────────────

    /// Record the owning user of a document.
    pub fn set_owner(&self, document_id: &DocumentId, user_id: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_OWNERS)?;
        self.db.put_cf(&cf, document_id.as_bytes(), user_id.as_bytes())?;
        Ok(())
    }

    /// Record many owners in one batch, as read from an owners listing.
    pub fn import_owners(&self, owners: &[(DocumentId, String)]) -> Result<(), StoreError> {
        let cf = self.cf(CF_OWNERS)?;
        let mut batch = WriteBatch::default();
        for (document_id, user_id) in owners {
            batch.put_cf(&cf, document_id.as_bytes(), user_id.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn owner(&self, document_id: &DocumentId) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_OWNERS)?;
        self.db
            .get_cf(&cf, document_id.as_bytes())?
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
            })
            .transpose()
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for DocumentStore {
    fn fetch(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        self.load_snapshot(document_id)
    }

    fn store(&self, document_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        let meta = self.save_snapshot(document_id, snapshot)?;
        log::debug!(
            "Saved snapshot for {document_id}: {} bytes ({} compressed), flush #{}",
            meta.snapshot_size,
            meta.compressed_size,
            meta.flush_count
        );
        Ok(())
    }
}

impl AccessPolicy for DocumentStore {
    fn can_access(&self, identity: &Identity, document_id: &DocumentId) -> bool {
        match self.owner(document_id) {
            Ok(Some(owner)) => owner == identity.user_id,
            Ok(None) => false,
            Err(e) => {
                log::error!("Owner lookup failed for {document_id}: {e}");
                false
            }
        }
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
