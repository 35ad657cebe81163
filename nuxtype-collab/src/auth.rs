//! Credential verification and per-document authorization.
//!
//! Tokens are compact HS256 JWTs issued by the web application. The
//! collaboration server only verifies them: signature (constant-time HMAC
//! comparison), algorithm, and the `exp`/`nbf` window. Whether a verified
//! identity may open a particular document is a separate question answered
//! by an [`AccessPolicy`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::protocol::DocumentId;

type HmacSha256 = Hmac<Sha256>;

/// Credential verification failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no authentication token provided")]
    MissingToken,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
}

/// Authenticated user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
}

/// Turns an opaque credential into an [`Identity`].
pub trait CredentialVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Decides whether an identity may join a document's session.
pub trait AccessPolicy: Send + Sync + 'static {
    fn can_access(&self, identity: &Identity, document_id: &DocumentId) -> bool;
}

/// Grants every authenticated identity access to every document.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_access(&self, _identity: &Identity, _document_id: &DocumentId) -> bool {
        true
    }
}

/// Claims carried by tokens the web application issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    pub email: String,
    /// Expiry, seconds since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Not-before, seconds since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

/// HS256 JWT verifier.
#[derive(Clone)]
pub struct JwtVerifier {
    secret: Vec<u8>,
    leeway: Duration,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            leeway: Duration::from_secs(30),
        }
    }

    /// Tolerance applied to `exp` and `nbf` for clock skew.
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }

    fn verify_at(&self, token: &str, now: u64) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed("expected three segments".into()));
        };

        let header: Header = decode_segment(header_b64)?;
        if header.alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let mut mac = self.mac();
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let claims: Claims = decode_segment(claims_b64)?;
        let leeway = self.leeway.as_secs();
        if let Some(exp) = claims.exp {
            if now > exp.saturating_add(leeway) {
                return Err(AuthError::Expired);
            }
        }
        if let Some(nbf) = claims.nbf {
            if now.saturating_add(leeway) < nbf {
                return Err(AuthError::NotYetValid);
            }
        }

        Ok(Identity {
            user_id: claims.user_id,
            email: claims.email,
        })
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.verify_at(token, unix_now())
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("secret", &"<redacted>")
            .field("leeway", &self.leeway)
            .finish()
    }
}

/// Mint an HS256 token. Issuance belongs to the web app; this exists for
/// tooling and tests.
pub fn sign_token(secret: &[u8], claims: &Claims) -> String {
    let header = Header {
        alg: "HS256".into(),
        typ: Some("JWT".into()),
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap_or_default());
    let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());

    let mut mac = JwtVerifier::new(secret).mac();
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(claims_b64.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{header_b64}.{claims_b64}.{signature}")
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::Malformed(e.to_string()))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    fn claims(exp: Option<u64>) -> Claims {
        Claims {
            user_id: "user-1".into(),
            email: "alice@example.com".into(),
            exp,
            nbf: None,
        }
    }

    #[test]
    fn test_valid_token() {
        let token = sign_token(SECRET, &claims(Some(unix_now() + 3600)));
        let identity = JwtVerifier::new(SECRET).verify(&token).unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.email, "alice@example.com");
    }

    #[test]
    fn test_token_without_expiry_accepted() {
        let token = sign_token(SECRET, &claims(None));
        assert!(JwtVerifier::new(SECRET).verify(&token).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = sign_token(b"other-secret", &claims(None));
        assert_eq!(
            JwtVerifier::new(SECRET).verify(&token).unwrap_err(),
            AuthError::InvalidSignature
        );
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let token = sign_token(SECRET, &claims(None));
        let forged = sign_token(
            SECRET,
            &Claims {
                user_id: "admin".into(),
                ..claims(None)
            },
        );
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_claims = forged.split('.').nth(1).unwrap();
        parts[1] = forged_claims;
        let spliced = parts.join(".");
        assert_eq!(
            JwtVerifier::new(SECRET).verify(&spliced).unwrap_err(),
            AuthError::InvalidSignature
        );
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new(SECRET).with_leeway(Duration::from_secs(10));
        let token = sign_token(SECRET, &claims(Some(1_000)));
        assert_eq!(verifier.verify_at(&token, 1_005).unwrap().user_id, "user-1");
        assert_eq!(verifier.verify_at(&token, 1_011).unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn test_not_yet_valid_rejected() {
        let verifier = JwtVerifier::new(SECRET).with_leeway(Duration::ZERO);
        let token = sign_token(
            SECRET,
            &Claims {
                nbf: Some(2_000),
                ..claims(None)
            },
        );
        assert_eq!(verifier.verify_at(&token, 1_999).unwrap_err(), AuthError::NotYetValid);
        assert!(verifier.verify_at(&token, 2_000).is_ok());
    }

    #[test]
    fn test_malformed_tokens() {
        let verifier = JwtVerifier::new(SECRET);
        assert_eq!(verifier.verify("").unwrap_err(), AuthError::MissingToken);
        assert!(matches!(verifier.verify("abc"), Err(AuthError::Malformed(_))));
        assert!(matches!(verifier.verify("a.b.c.d"), Err(AuthError::Malformed(_))));
        assert!(matches!(verifier.verify("!!.??.##"), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_unsupported_algorithm() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(br#"{"userId":"u","email":"e"}"#);
        let token = format!("{header}.{body}.");
        assert_eq!(
            JwtVerifier::new(SECRET).verify(&token).unwrap_err(),
            AuthError::UnsupportedAlgorithm("none".into())
        );
    }

    #[test]
    fn test_allow_all() {
        let identity = Identity {
            user_id: "u".into(),
            email: "e".into(),
        };
        let doc = DocumentId::parse("doc").unwrap();
        assert!(AllowAll.can_access(&identity, &doc));
    }
}
