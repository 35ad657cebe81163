//! Connection handshake and binary sync framing.
//!
//! A client opens a WebSocket naming the document in the request path
//! (`/<document-id>`) or a `document` query parameter, and presents a
//! bearer token in the `Authorization` header, a `token` cookie, or a
//! `token` query parameter. Path, query and cookie values are
//! percent-decoded before use.
//!
//! After the upgrade every frame is a bincode-encoded [`SyncMessage`]:
//! ```text
//! ┌──────────┬────────────────────┐
//! │ msg_type │ payload            │
//! │ 1 byte   │ len-prefixed bytes │
//! └──────────┴────────────────────┘
//! ```
//! Payloads of the sync types are opaque CRDT encodings and are handed to
//! the engine untouched.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, COOKIE};

/// Longest accepted document id, in bytes.
pub const MAX_DOCUMENT_ID_LEN: usize = 255;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector; the receiver answers with `SyncStep2`
    SyncStep1 = 1,
    /// Updates the peer is missing
    SyncStep2 = 2,
    /// Incremental change
    Update = 3,
    /// Ephemeral presence blob, relayed but never persisted
    Awareness = 4,
    /// The sender's update was refused by the engine
    UpdateRejected = 5,
    /// Authentication or authorization failed
    AccessDenied = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("handshake is missing a document id")]
    MissingDocumentId,
    #[error("handshake is missing a credential")]
    MissingToken,
    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
}

/// Opaque, stable identifier of a collaborative document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if raw.is_empty() {
            return Err(ProtocolError::MissingDocumentId);
        }
        if raw.len() > MAX_DOCUMENT_ID_LEN {
            return Err(ProtocolError::InvalidDocumentId(format!(
                "longer than {MAX_DOCUMENT_ID_LEN} bytes"
            )));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        {
            return Err(ProtocolError::InvalidDocumentId(format!(
                "unexpected character {bad:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What a client declared while opening its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub document_id: DocumentId,
    pub token: String,
}

impl Handshake {
    /// Extract the document id and bearer token from an upgrade request.
    pub fn from_request(request: &Request) -> Result<Self, ProtocolError> {
        let uri = request.uri();
        let query = uri.query().unwrap_or("");

        let path_id = percent_decode_str(uri.path().trim_matches('/')).decode_utf8_lossy();
        let raw_id = if path_id.is_empty() {
            query_param(query, "document").unwrap_or_default()
        } else {
            path_id
        };
        let document_id = DocumentId::parse(&raw_id)?;

        let header_token = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| Cow::Borrowed(v.trim()));
        let cookie_token = request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|cookies| cookie_value(cookies, "token"));

        let token = header_token
            .or(cookie_token)
            .or_else(|| query_param(query, "token"))
            .filter(|t| !t.is_empty())
            .ok_or(ProtocolError::MissingToken)?;

        Ok(Self {
            document_id,
            token: token.into_owned(),
        })
    }
}

/// Percent-decoded value of `key` in a query string.
fn query_param<'a>(query: &'a str, key: &str) -> Option<Cow<'a, str>> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| percent_decode_str(v).decode_utf8_lossy())
}

fn cookie_value<'a>(cookies: &'a str, key: &str) -> Option<Cow<'a, str>> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| percent_decode_str(v).decode_utf8_lossy())
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Create a sync step 1 (state vector).
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, state_vector)
    }

    /// Create a sync step 2 (missing updates).
    pub fn sync_step2(diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, diff)
    }

    /// Create an incremental update message.
    pub fn update(update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, update)
    }

    pub fn awareness(state: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, state)
    }

    /// Tell a client its update was refused; the payload carries the reason.
    pub fn update_rejected(reason: &str) -> Self {
        Self::new(MessageType::UpdateRejected, reason.as_bytes().to_vec())
    }

    pub fn access_denied(reason: &str) -> Self {
        Self::new(MessageType::AccessDenied, reason.as_bytes().to_vec())
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Vec::new())
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Payload interpreted as a UTF-8 reason (rejections and denials).
    pub fn reason(&self) -> Option<String> {
        match self.msg_type {
            MessageType::UpdateRejected | MessageType::AccessDenied => {
                Some(String::from_utf8_lossy(&self.payload).into_owned())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_handshake_from_path_and_bearer() {
        let req = request("/doc-1", &[("Authorization", "Bearer abc.def.ghi")]);
        let hs = Handshake::from_request(&req).unwrap();
        assert_eq!(hs.document_id.as_str(), "doc-1");
        assert_eq!(hs.token, "abc.def.ghi");
    }

    #[test]
    fn test_handshake_from_query_and_cookie() {
        let req = request("/?document=doc-2", &[("Cookie", "theme=dark; token=t0k3n")]);
        let hs = Handshake::from_request(&req).unwrap();
        assert_eq!(hs.document_id.as_str(), "doc-2");
        assert_eq!(hs.token, "t0k3n");
    }

    #[test]
    fn test_handshake_token_from_query() {
        let req = request("/doc-3?token=q", &[]);
        assert_eq!(Handshake::from_request(&req).unwrap().token, "q");
    }

    #[test]
    fn test_handshake_percent_decodes_query() {
        let req = request("/?document=workspace%3Anotes.md&token=abc", &[]);
        let hs = Handshake::from_request(&req).unwrap();
        assert_eq!(hs.document_id.as_str(), "workspace:notes.md");
        assert_eq!(hs.token, "abc");

        let req = request("/workspace%3Anotes.md?token=a%2Eb%2Ec", &[]);
        let hs = Handshake::from_request(&req).unwrap();
        assert_eq!(hs.document_id.as_str(), "workspace:notes.md");
        assert_eq!(hs.token, "a.b.c");
    }

    #[test]
    fn test_handshake_percent_decodes_cookie() {
        let req = request("/doc", &[("Cookie", "token=x%2Ey%2Dz")]);
        assert_eq!(Handshake::from_request(&req).unwrap().token, "x.y-z");
    }

    #[test]
    fn test_encoded_traversal_still_rejected() {
        let req = request("/?document=..%2Fetc%2Fpasswd&token=t", &[]);
        assert!(matches!(
            Handshake::from_request(&req),
            Err(ProtocolError::InvalidDocumentId(_))
        ));
    }

    #[test]
    fn test_header_takes_priority_over_cookie() {
        let req = request(
            "/doc",
            &[("Authorization", "Bearer from-header"), ("Cookie", "token=from-cookie")],
        );
        assert_eq!(Handshake::from_request(&req).unwrap().token, "from-header");
    }

    #[test]
    fn test_handshake_missing_document() {
        let req = request("/", &[("Authorization", "Bearer x")]);
        assert_eq!(
            Handshake::from_request(&req).unwrap_err(),
            ProtocolError::MissingDocumentId
        );
    }

    #[test]
    fn test_handshake_missing_token() {
        let req = request("/doc", &[("Authorization", "Basic dXNlcg==")]);
        assert_eq!(
            Handshake::from_request(&req).unwrap_err(),
            ProtocolError::MissingToken
        );
    }

    #[test]
    fn test_document_id_validation() {
        assert!(DocumentId::parse("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(DocumentId::parse("workspace:notes.md").is_ok());
        assert!(matches!(
            DocumentId::parse("../etc/passwd"),
            Err(ProtocolError::InvalidDocumentId(_))
        ));
        assert!(matches!(
            DocumentId::parse(&"a".repeat(MAX_DOCUMENT_ID_LEN + 1)),
            Err(ProtocolError::InvalidDocumentId(_))
        ));
    }

    #[test]
    fn test_sync_message_roundtrip() {
        let msg = SyncMessage::update(vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_rejection_reason() {
        let msg = SyncMessage::update_rejected("malformed update");
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::UpdateRejected);
        assert_eq!(decoded.reason().as_deref(), Some("malformed update"));
        assert!(SyncMessage::ping().reason().is_none());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_update_frame_overhead_small() {
        let msg = SyncMessage::update(vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() <= 50 + 4, "frame overhead too large: {}", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
        assert_eq!(MessageType::UpdateRejected as u8, 5);
        assert_eq!(MessageType::AccessDenied as u8, 6);
        assert_eq!(MessageType::Ping as u8, 7);
        assert_eq!(MessageType::Pong as u8, 8);
    }
}
