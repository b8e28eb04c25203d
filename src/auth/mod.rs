//! Bearer token authentication
//!
//! This module validates HMAC-signed JWTs carried in the `Authorization` header:
//! - Key derivation from the configured secret
//! - Signature, structure and expiry checks
//! - Claim extraction (subject, issue and expiry times, extra claims)

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Literal prefix of the `Authorization` header value
pub const BEARER_PREFIX: &str = "Bearer ";

/// Minimum HMAC key length in bytes
pub const MIN_KEY_LEN: usize = 32;

/// Authentication failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authorization header is missing or invalid")]
    MissingToken,

    /// The reason is for logs only
    #[error("Invalid or expired token: {reason}")]
    InvalidToken { reason: String },
}

impl AuthError {
    fn invalid(reason: impl Into<String>) -> Self {
        AuthError::InvalidToken {
            reason: reason.into(),
        }
    }

    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidToken { .. } => "invalid_token",
        }
    }
}

/// Identity claims decoded from a token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "sub", default)]
    pub subject: String,
    /// Expiry, seconds since the epoch
    #[serde(rename = "exp")]
    pub expires_at: i64,
    #[serde(rename = "iat", default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Derive the HMAC key from the secret.
///
/// Secrets shorter than [`MIN_KEY_LEN`] are right-padded with zero bytes, which
/// keeps tokens issued by the user service verifiable.
pub fn derive_key(secret: &[u8]) -> Vec<u8> {
    let mut key = secret.to_vec();
    if key.len() < MIN_KEY_LEN {
        key.resize(MIN_KEY_LEN, 0);
    }
    key
}

/// HMAC algorithms the key is strong enough for
fn allowed_algorithms(key_len: usize) -> Vec<Algorithm> {
    let mut algorithms = vec![Algorithm::HS256];
    if key_len >= 48 {
        algorithms.push(Algorithm::HS384);
    }
    if key_len >= 64 {
        algorithms.push(Algorithm::HS512);
    }
    algorithms
}

/// Validates bearer tokens; immutable once built
#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(secret: &str) -> Self {
        let key = derive_key(secret.as_bytes());

        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = allowed_algorithms(key.len());
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            key: DecodingKey::from_secret(&key),
            validation,
        }
    }

    /// Validate a raw `Authorization` header value
    pub fn validate(&self, header: Option<&str>) -> Result<Claims, AuthError> {
        let token = header
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .ok_or(AuthError::MissingToken)?;
        self.validate_token(token)
    }

    /// Validate a token without the `Bearer ` prefix
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::invalid(e.to_string()))?;

        // exp must lie strictly in the future
        let now = Utc::now().timestamp();
        if data.claims.expires_at <= now {
            return Err(AuthError::invalid(format!(
                "token expired at {}",
                data.claims.expires_at
            )));
        }

        Ok(data.claims)
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "artztall-test-secret";

    fn claims(subject: &str, expires_in: i64) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            subject: subject.to_string(),
            expires_at: now + expires_in,
            issued_at: Some(now),
            other: BTreeMap::new(),
        }
    }

    fn sign(secret: &str, algorithm: Algorithm, claims: &Claims) -> String {
        let key = EncodingKey::from_secret(&derive_key(secret.as_bytes()));
        encode(&Header::new(algorithm), claims, &key).unwrap()
    }

    #[test]
    fn test_derive_key_pads_short_secret() {
        let key = derive_key(b"abc");
        assert_eq!(key.len(), MIN_KEY_LEN);
        assert_eq!(&key[..3], b"abc");
        assert!(key[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_derive_key_keeps_long_secret() {
        let secret = [7u8; 40];
        assert_eq!(derive_key(&secret), secret.to_vec());
    }

    #[test]
    fn test_missing_token() {
        let validator = TokenValidator::new(SECRET);
        assert_eq!(validator.validate(None), Err(AuthError::MissingToken));
        assert_eq!(validator.validate(Some("")), Err(AuthError::MissingToken));
        assert_eq!(validator.validate(Some("Bearer")), Err(AuthError::MissingToken));
        assert_eq!(
            validator.validate(Some("Basic dXNlcjpwYXNz")),
            Err(AuthError::MissingToken)
        );
        assert_eq!(validator.validate(Some("bearer abc")), Err(AuthError::MissingToken));
    }

    #[test]
    fn test_valid_token() {
        let validator = TokenValidator::new(SECRET);
        let mut expected = claims("artist-42", 3600);
        expected
            .other
            .insert("role".to_string(), serde_json::json!("ARTIST"));
        let token = sign(SECRET, Algorithm::HS256, &expected);

        let decoded = validator.validate(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(decoded.subject, "artist-42");
        assert_eq!(decoded.expires_at, expected.expires_at);
        assert_eq!(decoded.other.get("role"), Some(&serde_json::json!("ARTIST")));
    }

    #[test]
    fn test_expired_token() {
        let validator = TokenValidator::new(SECRET);
        let token = sign(SECRET, Algorithm::HS256, &claims("user", -10));

        let err = validator.validate(Some(&format!("Bearer {token}"))).unwrap_err();
        assert_eq!(err.label(), "invalid_token");
    }

    #[test]
    fn test_token_expiring_now_is_rejected() {
        let validator = TokenValidator::new(SECRET);
        let token = sign(SECRET, Algorithm::HS256, &claims("user", 0));
        assert!(validator.validate_token(&token).is_err());
    }

    #[test]
    fn test_bad_signature() {
        let validator = TokenValidator::new(SECRET);
        let token = sign("some-other-secret", Algorithm::HS256, &claims("user", 3600));

        assert!(matches!(
            validator.validate_token(&token),
            Err(AuthError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_malformed_token() {
        let validator = TokenValidator::new(SECRET);
        for token in ["", "not-a-jwt", "a.b.c", "Bearer x.y"] {
            assert!(matches!(
                validator.validate(Some(&format!("Bearer {token}"))),
                Err(AuthError::InvalidToken { .. })
            ));
        }
    }

    #[test]
    fn test_missing_expiry_is_rejected() {
        #[derive(Serialize)]
        struct NoExpiry {
            sub: String,
        }
        let validator = TokenValidator::new(SECRET);
        let key = EncodingKey::from_secret(&derive_key(SECRET.as_bytes()));
        let token = encode(
            &Header::new(Algorithm::HS256),
            &NoExpiry {
                sub: "user".to_string(),
            },
            &key,
        )
        .unwrap();

        assert!(validator.validate_token(&token).is_err());
    }

    #[test]
    fn test_algorithm_strength_follows_key_length() {
        let short = TokenValidator::new(SECRET);
        let token = sign(SECRET, Algorithm::HS512, &claims("user", 3600));
        assert!(short.validate_token(&token).is_err());

        let long_secret = "x".repeat(64);
        let long = TokenValidator::new(&long_secret);
        let token = sign(&long_secret, Algorithm::HS512, &claims("user", 3600));
        assert_eq!(long.validate_token(&token).unwrap().subject, "user");
    }

    #[test]
    fn test_error_labels() {
        let err = AuthError::invalid("InvalidSignature");
        assert!(err.to_string().ends_with("InvalidSignature"));
        assert_eq!(err.label(), "invalid_token");
        assert_eq!(AuthError::MissingToken.label(), "missing_token");
    }
}
