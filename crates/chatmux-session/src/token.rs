//! Access tokens bound to a session.
//!
//! A handle mints a token each time it becomes `Ready`. The token names
//! the session and the handle's *incarnation*, a random value chosen when
//! the handle is spawned. [`SessionRegistry::resolve_token`] only accepts a
//! token whose incarnation matches the handle currently registered, so
//! tokens stop resolving once their handle is closed, even if a new
//! session with the same id is created afterwards.
//!
//! Signing is behind the [`TokenIssuer`] trait. The bundled
//! [`HmacTokenIssuer`] produces compact HS256 JWTs with the claims
//! `{ sessionId, inc, iat, exp }`.
//!
//! [`SessionRegistry::resolve_token`]: crate::SessionRegistry::resolve_token

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chatmux_protocol::SessionId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::SessionError;

type HmacSha256 = Hmac<Sha256>;

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Claims carried by an access token. Times are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    #[serde(rename = "inc")]
    pub incarnation: u64,
    pub iat: i64,
    pub exp: i64,
}

impl TokenClaims {
    pub fn new(session_id: SessionId, incarnation: u64, issued_at: i64, ttl_secs: i64) -> Self {
        Self {
            session_id,
            incarnation,
            iat: issued_at,
            exp: issued_at.saturating_add(ttl_secs),
        }
    }

    /// Returns `true` once `now` has reached the expiry.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.exp
    }
}

/// A minted token together with the claims it encodes.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub claims: TokenClaims,
}

impl AccessToken {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.claims.is_expired_at(now)
    }
}

// Keeps the bearer string out of logs.
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("claims", &self.claims)
            .finish()
    }
}

/// Signs and verifies access tokens.
pub trait TokenIssuer: Send + Sync + 'static {
    /// Encodes and signs `claims`.
    fn issue(&self, claims: &TokenClaims) -> Result<String, SessionError>;

    /// Verifies the signature and expiry of `token` at time `now`.
    ///
    /// # Errors
    /// - [`SessionError::AuthInvalid`] for malformed or tampered tokens
    /// - [`SessionError::AuthExpired`] when `now >= exp`
    fn verify(&self, token: &str, now: i64) -> Result<TokenClaims, SessionError>;
}

/// HS256 issuer keyed by a process-wide shared secret.
pub struct HmacTokenIssuer {
    secret: Vec<u8>,
}

impl HmacTokenIssuer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, SessionError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SessionError::AuthInvalid(format!("signing key rejected: {e}")))
    }
}

impl TokenIssuer for HmacTokenIssuer {
    fn issue(&self, claims: &TokenClaims) -> Result<String, SessionError> {
        let payload = serde_json::to_vec(claims)
            .map_err(|e| SessionError::AuthInvalid(format!("claims not encodable: {e}")))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }

    fn verify(&self, token: &str, now: i64) -> Result<TokenClaims, SessionError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SessionError::AuthInvalid("expected three segments".into()));
        };

        let header_json = URL_SAFE_NO_PAD
            .decode(header)
            .map_err(|_| SessionError::AuthInvalid("header is not base64url".into()))?;
        let header: serde_json::Value = serde_json::from_slice(&header_json)
            .map_err(|_| SessionError::AuthInvalid("header is not JSON".into()))?;
        if header.get("alg").and_then(|alg| alg.as_str()) != Some("HS256") {
            return Err(SessionError::AuthInvalid("unsupported algorithm".into()));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SessionError::AuthInvalid("signature is not base64url".into()))?;
        let mut mac = self.mac()?;
        mac.update(header_segment_and_payload(token).as_bytes());
        // constant-time comparison
        mac.verify_slice(&signature)
            .map_err(|_| SessionError::AuthInvalid("signature mismatch".into()))?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| SessionError::AuthInvalid("payload is not base64url".into()))?;
        let claims: TokenClaims = serde_json::from_slice(&claims_json)
            .map_err(|e| SessionError::AuthInvalid(format!("bad claims: {e}")))?;

        if claims.is_expired_at(now) {
            return Err(SessionError::AuthExpired);
        }
        Ok(claims)
    }
}

/// The `header.payload` prefix a signature covers.
fn header_segment_and_payload(token: &str) -> &str {
    token.rsplit_once('.').map_or(token, |(signed, _)| signed)
}
