//! User records and password hashing
//!
//! A user's stored credential is `H(id ":" realm ":" plaintext)` in
//! lowercase hex. SHA-256 is written; MD5 hashes from older installations
//! are still recognized on read (the scheme is detected by digest length).
//! All digest comparisons are constant-time.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::dict::Dict;
use crate::error::Result;
use crate::storage::{ObjectCore, StorableObject};

/// Hidden dict key holding the password hash
const PASSWORD_KEY: &str = ".password";

/// Hex length of an MD5 digest (legacy hash scheme)
const MD5_HEX_LEN: usize = 32;

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex_encode(&digest)
}

pub fn md5_hex(input: &str) -> String {
    let digest = md5::compute(input.as_bytes());
    hex_encode(&digest.0)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Constant-time string equality
///
/// Length differences short-circuit, which is fine: digest lengths are
/// public information.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// A storage-backed user record
pub struct User {
    core: ObjectCore,
}

impl User {
    /// Constructor registered under the `user` initializer symbol
    pub fn create(id: &str, object_type: &str, dict: Dict) -> Result<Arc<dyn StorableObject>> {
        Ok(Arc::new(Self {
            core: ObjectCore::new(id, object_type, dict),
        }))
    }

    /// Build a fresh user record with a hashed password
    pub fn new_user(id: &str, realm: &str, plaintext: &str) -> Arc<User> {
        let mut dict = Dict::new();
        dict.set("id", id)
            .set("type", "user")
            .set("realm", realm)
            .set("enabled", true)
            .set(PASSWORD_KEY, password_hash(id, realm, plaintext));
        Arc::new(Self {
            core: ObjectCore::new(id, "user", dict),
        })
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn realm(&self) -> String {
        self.core.with_dict(|d| d.str_or("realm", "Plexus").to_string())
    }

    pub fn is_enabled(&self) -> bool {
        self.core.with_dict(|d| d.bool_or("enabled", true))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.core.update(|d| {
            d.set("enabled", enabled);
        });
    }

    /// Role ids attached to this user, in declaration order
    pub fn role_ids(&self) -> Vec<String> {
        self.core.with_dict(|d| {
            d.str_array("role").into_iter().map(str::to_string).collect()
        })
    }

    /// The stored password hash (empty when the user has none)
    pub fn password_hash(&self) -> String {
        self.core.with_dict(|d| {
            d.get_str(PASSWORD_KEY)
                .or_else(|| d.get_str("password"))
                .unwrap_or("")
                .to_string()
        })
    }

    /// Replace the password, writing a SHA-256 hash
    pub fn set_password(&self, plaintext: &str) {
        let hash = password_hash(self.core.id(), &self.realm(), plaintext);
        self.core.update(|d| {
            d.remove("password");
            d.set(PASSWORD_KEY, hash.as_str());
        });
    }

    /// Verify a plaintext password against the stored hash
    pub fn verify_password(&self, plaintext: &str) -> bool {
        let stored = self.password_hash();
        let input = format!("{}:{}:{}", self.core.id(), self.realm(), plaintext);
        let candidate = if stored.len() == MD5_HEX_LEN {
            md5_hex(&input)
        } else {
            sha256_hex(&input)
        };
        constant_time_eq(&stored, &candidate)
    }

    /// Verify a digest challenge: expected must equal `MD5(hash + suffix)`
    pub fn verify_hash_challenge(&self, suffix: &str, expected: &str) -> bool {
        let computed = md5_hex(&format!("{}{}", self.password_hash(), suffix));
        constant_time_eq(&computed, expected)
    }

    /// Most recent explicit authorization stamp (epoch when never set)
    ///
    /// Tokens and sessions minted before this instant are rejected; used
    /// to force re-authentication after credential changes.
    pub fn authorized_time(&self) -> DateTime<Utc> {
        self.core
            .with_dict(|d| d.time("authorizedTime"))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Advance the authorization stamp; earlier values are ignored so the
    /// stamp stays monotonic
    pub fn set_authorized_time(&self, time: DateTime<Utc>) {
        if time <= self.authorized_time() {
            return;
        }
        self.core.update(|d| {
            d.set("authorizedTime", time);
        });
    }
}

/// Hash a credential triple into lowercase hex
pub fn password_hash(id: &str, realm: &str, plaintext: &str) -> String {
    sha256_hex(&format!("{}:{}:{}", id, realm, plaintext))
}

impl StorableObject for User {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the hash stays out of debug output
        f.debug_struct("User")
            .field("id", &self.core.id())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
