//! Nonces and authentication tokens
//!
//! Two bearer formats share the same validity rule (unexpired, user
//! enabled, not invalidated by a later authorization stamp):
//!
//! - the native token `base64(id ":" expiryMillis ":" digest)` where
//!   `digest = sha256(id ":" expiry ":" passwordHash)`;
//! - an HS256 JWT keyed by the user's stored password hash.
//!
//! Nonces are bare decimal epoch-milli strings checked only for recency.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{AuthKind, Error, Result};

use super::user::{constant_time_eq, sha256_hex, User};

/// Tolerated clock skew for nonces minted slightly in the future
const NONCE_SKEW_MS: i64 = 60_000;

/// Issue a fresh server nonce
pub fn create_nonce() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Check a nonce for recency; nonces are never persisted
pub fn verify_nonce(nonce: &str, max_age_minutes: i64) -> Result<()> {
    let minted: i64 = nonce
        .parse()
        .map_err(|_| Error::Auth(AuthKind::BadCredential))?;
    let age = Utc::now().timestamp_millis() - minted;
    if age < -NONCE_SKEW_MS || age > max_age_minutes * 60_000 {
        return Err(Error::Auth(AuthKind::Stale));
    }
    Ok(())
}

/// Create a native auth token valid until `expiry`
pub fn create_auth_token(user: &User, expiry: DateTime<Utc>) -> String {
    let expiry_ms = expiry.timestamp_millis();
    let digest = sha256_hex(&format!(
        "{}:{}:{}",
        user.id(),
        expiry_ms,
        user.password_hash()
    ));
    STANDARD.encode(format!("{}:{}:{}", user.id(), expiry_ms, digest))
}

/// Decode a native auth token into `(id, expiryMillis, digest)`
///
/// Lenient by design: missing parts come back empty and a non-numeric
/// expiry becomes 0, so validation fails on the comparison rather than a
/// parse error.
pub fn decode_auth_token(token: &str) -> (String, i64, String) {
    let raw = STANDARD
        .decode(token.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default();
    let mut parts = raw.splitn(3, ':');
    let id = parts.next().unwrap_or("").to_string();
    let expiry = parts.next().unwrap_or("").parse().unwrap_or(0);
    let digest = parts.next().unwrap_or("").to_string();
    (id, expiry, digest)
}

/// Validate a native auth token for a resolved user
pub fn validate_auth_token(user: &User, token: &str) -> Result<()> {
    let (id, expiry_ms, digest) = decode_auth_token(token);
    if expiry_ms < Utc::now().timestamp_millis() {
        return Err(Error::Auth(AuthKind::Expired));
    }
    let expected = sha256_hex(&format!("{}:{}:{}", id, expiry_ms, user.password_hash()));
    if !constant_time_eq(&expected, &digest) || id != user.id() {
        return Err(Error::Auth(AuthKind::BadCredential));
    }
    if !user.is_enabled() {
        return Err(Error::Auth(AuthKind::Disabled));
    }
    let expiry = Utc
        .timestamp_millis_opt(expiry_ms)
        .single()
        .ok_or(Error::Auth(AuthKind::BadCredential))?;
    if user.authorized_time() > expiry {
        return Err(Error::Auth(AuthKind::Expired));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    sub: String,
    exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
}

/// Create an HS256 JWT keyed by the user's password hash
pub fn create_jwt(user: &User, expiry: DateTime<Utc>) -> Result<String> {
    let claims = JwtClaims {
        sub: user.id().to_string(),
        exp: expiry.timestamp(),
        iat: Some(Utc::now().timestamp()),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(user.password_hash().as_bytes()),
    )
    .map_err(|e| Error::Internal(format!("JWT encoding failed: {}", e)))
}

/// Validate an HS256 JWT for a resolved user
pub fn validate_jwt(user: &User, token: &str) -> Result<()> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(user.password_hash().as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => Error::Auth(AuthKind::Expired),
        _ => Error::Auth(AuthKind::BadCredential),
    })?;
    if data.claims.sub != user.id() {
        return Err(Error::Auth(AuthKind::BadCredential));
    }
    if !user.is_enabled() {
        return Err(Error::Auth(AuthKind::Disabled));
    }
    let expiry = Utc
        .timestamp_opt(data.claims.exp, 0)
        .single()
        .ok_or(Error::Auth(AuthKind::BadCredential))?;
    if user.authorized_time() > expiry {
        return Err(Error::Auth(AuthKind::Expired));
    }
    Ok(())
}

/// True if a bearer credential looks like a JWT
pub fn is_jwt(token: &str) -> bool {
    token.split('.').count() == 3
}

/// Extract the subject id from either token format without validating
///
/// Used to resolve the user record before the real validation runs.
pub fn token_subject(token: &str) -> Option<String> {
    if is_jwt(token) {
        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        value.get("sub")?.as_str().map(str::to_string)
    } else {
        let (id, _, _) = decode_auth_token(token);
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn alice() -> std::sync::Arc<User> {
        User::new_user("alice", "Plexus", "correct horse")
    }

    #[test]
    fn test_nonce_round_trip() {
        let nonce = create_nonce();
        assert!(verify_nonce(&nonce, 240).is_ok());
    }

    #[test]
    fn test_stale_nonce_rejected() {
        let old = (Utc::now() - Duration::minutes(241)).timestamp_millis();
        assert!(matches!(
            verify_nonce(&old.to_string(), 240),
            Err(Error::Auth(AuthKind::Stale))
        ));
    }

    #[test]
    fn test_garbage_nonce_rejected() {
        assert!(matches!(
            verify_nonce("not-a-number", 240),
            Err(Error::Auth(AuthKind::BadCredential))
        ));
    }

    #[test]
    fn test_token_round_trip() {
        let user = alice();
        let expiry = Utc::now() + Duration::hours(1);
        let token = create_auth_token(&user, expiry);

        let (id, expiry_ms, digest) = decode_auth_token(&token);
        assert_eq!(id, "alice");
        assert_eq!(expiry_ms, expiry.timestamp_millis());
        assert_eq!(digest.len(), 64);

        assert!(validate_auth_token(&user, &token).is_ok());
    }

    #[test]
    fn test_expired_token_rejected() {
        let user = alice();
        let token = create_auth_token(&user, Utc::now() - Duration::minutes(1));
        assert!(matches!(
            validate_auth_token(&user, &token),
            Err(Error::Auth(AuthKind::Expired))
        ));
    }

    #[test]
    fn test_any_bit_flip_is_rejected() {
        let user = alice();
        let token = create_auth_token(&user, Utc::now() + Duration::hours(1));
        let raw = STANDARD.decode(&token).unwrap();
        // flip one bit in the digest portion
        let mut mutated = raw.clone();
        let last = mutated.len() - 1;
        mutated[last] ^= 0x01;
        let bad = STANDARD.encode(&mutated);
        assert!(matches!(
            validate_auth_token(&user, &bad),
            Err(Error::Auth(AuthKind::BadCredential))
        ));
    }

    #[test]
    fn test_malformed_token_degrades_gracefully() {
        let (id, expiry, digest) = decode_auth_token("!!!not-base64!!!");
        assert_eq!((id.as_str(), expiry, digest.as_str()), ("", 0, ""));

        let partial = STANDARD.encode("justid");
        let (id, expiry, digest) = decode_auth_token(&partial);
        assert_eq!(id, "justid");
        assert_eq!(expiry, 0);
        assert_eq!(digest, "");
    }

    #[test]
    fn test_disabled_user_rejected() {
        let user = alice();
        let token = create_auth_token(&user, Utc::now() + Duration::hours(1));
        user.set_enabled(false);
        assert!(matches!(
            validate_auth_token(&user, &token),
            Err(Error::Auth(AuthKind::Disabled))
        ));
    }

    #[test]
    fn test_authorized_time_invalidates_older_tokens() {
        let user = alice();
        let expiry = Utc::now() + Duration::hours(1);
        let token = create_auth_token(&user, expiry);
        assert!(validate_auth_token(&user, &token).is_ok());

        user.set_authorized_time(Utc::now() + Duration::hours(2));
        assert!(matches!(
            validate_auth_token(&user, &token),
            Err(Error::Auth(AuthKind::Expired))
        ));
    }

    #[test]
    fn test_jwt_round_trip() {
        let user = alice();
        let token = create_jwt(&user, Utc::now() + Duration::hours(1)).unwrap();
        assert!(is_jwt(&token));
        assert_eq!(token_subject(&token), Some("alice".to_string()));
        assert!(validate_jwt(&user, &token).is_ok());
    }

    #[test]
    fn test_jwt_signature_tamper_rejected() {
        let user = alice();
        let token = create_jwt(&user, Utc::now() + Duration::hours(1)).unwrap();
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        let mut sig = parts[2].clone().into_bytes();
        sig[0] = if sig[0] == b'A' { b'B' } else { b'A' };
        parts[2] = String::from_utf8(sig).unwrap();
        let tampered = parts.join(".");
        assert!(matches!(
            validate_jwt(&user, &tampered),
            Err(Error::Auth(AuthKind::BadCredential))
        ));
    }

    #[test]
    fn test_jwt_authorized_time_rule() {
        let user = alice();
        let token = create_jwt(&user, Utc::now() + Duration::hours(1)).unwrap();
        user.set_authorized_time(Utc::now() + Duration::hours(2));
        assert!(matches!(
            validate_jwt(&user, &token),
            Err(Error::Auth(AuthKind::Expired))
        ));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_any_bit_flip_is_rejected(byte in 0usize..256, bit in 0u8..8) {
                let user = User::new_user("alice", "Plexus", "correct horse");
                let expiry = Utc::now() + Duration::hours(1);
                let token = create_auth_token(&user, expiry);
                let raw = STANDARD.decode(&token).unwrap();

                let mut mutated = raw.clone();
                let index = byte % mutated.len();
                mutated[index] ^= 1 << bit;

                let bad = STANDARD.encode(&mutated);
                prop_assert!(validate_auth_token(&user, &bad).is_err());
            }

            #[test]
            fn prop_valid_tokens_always_validate(hours in 1i64..1000) {
                let user = User::new_user("alice", "Plexus", "correct horse");
                let token = create_auth_token(&user, Utc::now() + Duration::hours(hours));
                prop_assert!(validate_auth_token(&user, &token).is_ok());
            }
        }
    }

    #[test]
    fn test_token_subject_for_native_token() {
        let user = alice();
        let token = create_auth_token(&user, Utc::now() + Duration::hours(1));
        assert_eq!(token_subject(&token), Some("alice".to_string()));
        assert_eq!(token_subject("garbage"), None);
    }
}
