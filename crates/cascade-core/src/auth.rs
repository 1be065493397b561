//! Token verification and signing.
//!
//! Tokens are JWTs. The engine distinguishes three failure kinds the
//! server reacts to differently: expired, malformed, and invalid. Auth
//! failures are soft at the protocol level; the session stays connected
//! and unauthenticated.

use cascade_protocol::WireError;
use jsonwebtoken::{
    errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default token lifetime injected at signing time, in seconds.
pub const DEFAULT_EXPIRY_SECS: u64 = 86_400;

/// Token verification and signing failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TokenError {
    /// The token's `exp` is in the past.
    #[error("Token has expired")]
    Expired,

    /// The token is not structurally a JWT.
    #[error("Token is malformed: {0}")]
    Malformed(String),

    /// The token failed verification.
    #[error("Token verification failed: {0}")]
    Invalid(String),

    /// The token could not be signed.
    #[error("Token signing failed: {0}")]
    Sign(String),
}

impl TokenError {
    /// The stable wire name of this failure kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            TokenError::Expired => "TokenExpired",
            TokenError::Malformed(_) => "TokenMalformed",
            TokenError::Invalid(_) => "TokenInvalid",
            TokenError::Sign(_) => "TokenSignFailed",
        }
    }

    /// Serialize into the structured wire representation.
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        WireError::new(self.name(), self.to_string())
    }
}

impl From<TokenError> for WireError {
    fn from(error: TokenError) -> Self {
        error.to_wire()
    }
}

/// Key material for the JWT engine.
#[derive(Debug, Clone)]
pub enum AuthKeys {
    /// Shared secret for HMAC algorithms.
    Symmetric(String),
    /// RSA key pair in PEM form.
    Asymmetric {
        /// Private signing key.
        private_pem: String,
        /// Public verification key.
        public_pem: String,
    },
}

/// Pluggable token codec.
pub trait AuthEngine: Send + Sync {
    /// Verify a signed token and return its decoded claims.
    ///
    /// # Errors
    ///
    /// Returns the failure kind: expired, malformed, or invalid.
    fn verify_token(&self, signed: &str) -> Result<Value, TokenError>;

    /// Sign a claims object.
    ///
    /// # Errors
    ///
    /// Returns an error when the claims cannot be signed.
    fn sign_token(&self, claims: &Value) -> Result<String, TokenError>;
}

/// JWT engine over `jsonwebtoken`.
pub struct JwtAuthEngine {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    default_expiry_secs: u64,
}

impl JwtAuthEngine {
    /// Build an engine from key material.
    ///
    /// # Errors
    ///
    /// Returns an error when PEM keys cannot be parsed.
    pub fn new(
        keys: &AuthKeys,
        algorithm: Algorithm,
        default_expiry_secs: u64,
    ) -> Result<Self, TokenError> {
        let (encoding, decoding) = match keys {
            AuthKeys::Symmetric(secret) => (
                EncodingKey::from_secret(secret.as_bytes()),
                DecodingKey::from_secret(secret.as_bytes()),
            ),
            AuthKeys::Asymmetric {
                private_pem,
                public_pem,
            } => (
                EncodingKey::from_rsa_pem(private_pem.as_bytes())
                    .map_err(|e| TokenError::Invalid(format!("bad private key: {e}")))?,
                DecodingKey::from_rsa_pem(public_pem.as_bytes())
                    .map_err(|e| TokenError::Invalid(format!("bad public key: {e}")))?,
            ),
        };

        Ok(Self {
            encoding,
            decoding,
            algorithm,
            default_expiry_secs,
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        // exp is optional but enforced when present; no clock slack so
        // a token expired one second ago classifies as expired.
        validation.required_spec_claims.clear();
        validation.leeway = 0;
        validation
    }
}

impl AuthEngine for JwtAuthEngine {
    fn verify_token(&self, signed: &str) -> Result<Value, TokenError> {
        let data = jsonwebtoken::decode::<Value>(signed, &self.decoding, &self.validation())
            .map_err(|error| match error.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => TokenError::Malformed(error.to_string()),
                _ => TokenError::Invalid(error.to_string()),
            })?;
        Ok(data.claims)
    }

    fn sign_token(&self, claims: &Value) -> Result<String, TokenError> {
        let mut claims = claims.clone();
        let object = claims
            .as_object_mut()
            .ok_or_else(|| TokenError::Sign("claims must be a JSON object".into()))?;

        if !object.contains_key("exp") {
            object.insert(
                "exp".into(),
                Value::from(now_secs() + self.default_expiry_secs),
            );
        }

        jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| TokenError::Sign(e.to_string()))
    }
}

/// Current time in seconds since epoch.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Current time in milliseconds since epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Read the `exp` claim of a decoded token, if any.
#[must_use]
pub fn token_expiry(token: &Value) -> Option<u64> {
    let exp = token.get("exp")?;
    exp.as_u64().or_else(|| exp.as_f64().map(|v| v as u64))
}

/// A decoded token is expired iff it carries an `exp` in the past.
#[must_use]
pub fn is_token_expired(token: &Value, now_ms: u64) -> bool {
    token_expiry(token).is_some_and(|exp| exp * 1000 < now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> JwtAuthEngine {
        JwtAuthEngine::new(
            &AuthKeys::Symmetric("test-secret".into()),
            Algorithm::HS256,
            DEFAULT_EXPIRY_SECS,
        )
        .unwrap()
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let engine = engine();
        let signed = engine.sign_token(&json!({"username": "bob"})).unwrap();
        let claims = engine.verify_token(&signed).unwrap();

        assert_eq!(claims["username"], "bob");
        // Default expiry was injected.
        let exp = token_expiry(&claims).unwrap();
        assert!(exp >= now_secs() + DEFAULT_EXPIRY_SECS - 5);
    }

    #[test]
    fn test_explicit_expiry_is_preserved() {
        let engine = engine();
        let exp = now_secs() + 3600;
        let signed = engine.sign_token(&json!({"exp": exp})).unwrap();
        let claims = engine.verify_token(&signed).unwrap();
        assert_eq!(token_expiry(&claims), Some(exp));
    }

    #[test]
    fn test_expired_token_classifies_expired() {
        let engine = engine();
        let signed = engine
            .sign_token(&json!({"exp": now_secs() - 1}))
            .unwrap();
        assert_eq!(engine.verify_token(&signed), Err(TokenError::Expired));
    }

    #[test]
    fn test_malformed_token() {
        let engine = engine();
        match engine.verify_token("not-a-token") {
            Err(TokenError::Malformed(_)) => {}
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_key_classifies_invalid() {
        let signer = JwtAuthEngine::new(
            &AuthKeys::Symmetric("key-a".into()),
            Algorithm::HS256,
            DEFAULT_EXPIRY_SECS,
        )
        .unwrap();
        let verifier = JwtAuthEngine::new(
            &AuthKeys::Symmetric("key-b".into()),
            Algorithm::HS256,
            DEFAULT_EXPIRY_SECS,
        )
        .unwrap();

        let signed = signer.sign_token(&json!({"username": "eve"})).unwrap();
        match verifier.verify_token(&signed) {
            Err(TokenError::Invalid(_)) => {}
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_sign_rejects_non_object_claims() {
        let engine = engine();
        assert!(matches!(
            engine.sign_token(&json!("just a string")),
            Err(TokenError::Sign(_))
        ));
    }

    #[test]
    fn test_expiry_inspection() {
        let now = now_ms();
        assert!(is_token_expired(&json!({"exp": 1000}), now));
        assert!(!is_token_expired(
            &json!({"exp": now / 1000 + 3600}),
            now
        ));
        // No exp claim means the token never expires.
        assert!(!is_token_expired(&json!({"username": "bob"}), now));
    }

    #[test]
    fn test_error_wire_names() {
        assert_eq!(TokenError::Expired.name(), "TokenExpired");
        assert_eq!(TokenError::Malformed(String::new()).name(), "TokenMalformed");
        assert_eq!(TokenError::Invalid(String::new()).name(), "TokenInvalid");
    }
}
