//! Server and persistence configuration.
//!
//! Defaults suit a local deployment; [`ServerConfig::from_env`] overlays the
//! environment variables the deployment scripts set.
//!
//! Document owners are provisioned from a plain listing named by
//! `COLLAB_OWNERS_FILE`, one `<document-id> <user-id>` pair per line:
//! ```text
//! # document            owner
//! 550e8400-e29b-41d4    7f3c2a
//! workspace:notes.md    alice
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DocumentId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("cannot read {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("owners listing line {line}: {reason}")]
    OwnersLine { line: usize, reason: String },
}

/// When and how dirty session state is written back to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Quiescence window: flush once no edit arrived for this long
    pub debounce: Duration,
    /// Staleness bound: flush at the latest this long after the first unsaved edit
    pub max_debounce: Duration,
    /// Store attempts per flush before the session is marked degraded
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt
    pub retry_backoff: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(2_000),
            max_debounce: Duration::from_millis(10_000),
            retry_attempts: 5,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// Interval of the sweep that evicts idle sessions, in seconds
    pub heartbeat_interval_secs: u64,
    /// How long to wait for a client's opening state vector after auth
    pub initial_sync_timeout: Duration,
    /// Undecodable frames tolerated before a connection is closed
    pub max_protocol_violations: u32,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Owners listing imported at startup
    pub owners_file: Option<PathBuf>,
    /// Shared secret used to verify HS256 credentials
    pub jwt_secret: String,
    pub persistence: PersistenceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            initial_sync_timeout: Duration::from_millis(500),
            max_protocol_violations: 8,
            storage_path: None,
            owners_file: None,
            jwt_secret: String::new(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let host = lookup("COLLAB_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse_or("COLLAB_PORT", lookup("COLLAB_PORT"), 1234)?;
        config.bind_addr = format!("{host}:{port}");

        config.storage_path = lookup("COLLAB_STORAGE_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        config.owners_file = lookup("COLLAB_OWNERS_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let debounce = parse_or("COLLAB_DEBOUNCE_MS", lookup("COLLAB_DEBOUNCE_MS"), 2_000)?;
        let max_debounce =
            parse_or("COLLAB_MAX_DEBOUNCE_MS", lookup("COLLAB_MAX_DEBOUNCE_MS"), 10_000)?;
        if max_debounce < debounce {
            return Err(ConfigError::Invalid {
                name: "COLLAB_MAX_DEBOUNCE_MS",
                value: max_debounce.to_string(),
            });
        }
        config.persistence.debounce = Duration::from_millis(debounce);
        config.persistence.max_debounce = Duration::from_millis(max_debounce);

        Ok(config)
    }
}

/// Read and parse an owners listing.
pub fn read_owners(path: &Path) -> Result<Vec<(DocumentId, String)>, ConfigError> {
    let listing = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_owners(&listing)
}

/// Parse `<document-id> <user-id>` lines. Blank lines and `#` comments are
/// skipped; a later line for the same document wins.
pub fn parse_owners(listing: &str) -> Result<Vec<(DocumentId, String)>, ConfigError> {
    let mut owners = Vec::new();
    for (index, line) in listing.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bad = |reason: String| ConfigError::OwnersLine {
            line: index + 1,
            reason,
        };
        let mut fields = line.split_whitespace();
        let (Some(document), Some(user), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(bad("expected a document id and a user id".to_string()));
        };
        let document_id = DocumentId::parse(document).map_err(|e| bad(e.to_string()))?;
        owners.push((document_id, user.to_string()));
    }
    Ok(owners)
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
