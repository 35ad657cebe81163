//! Crate-level error type.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::crdt::MergeError;
use crate::protocol::{DocumentId, ProtocolError};
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("user {user_id} may not access document {document_id}")]
    AccessDenied {
        document_id: DocumentId,
        user_id: String,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    /// The stored snapshot could not be loaded into a document.
    /// The bytes in the store are left untouched.
    #[error("failed to hydrate document {document_id}: {source}")]
    Hydration {
        document_id: DocumentId,
        #[source]
        source: MergeError,
    },

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CollabError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hydration_error_keeps_source() {
        use std::error::Error as _;

        let err = CollabError::Hydration {
            document_id: DocumentId::parse("doc-1").unwrap(),
            source: MergeError::MalformedUpdate("truncated".into()),
        };
        assert!(err.to_string().contains("doc-1"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_from_conversions() {
        let err: CollabError = AuthError::Expired.into();
        assert!(matches!(err, CollabError::Auth(AuthError::Expired)));

        let err: CollabError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(err, CollabError::Store(_)));
    }
}
