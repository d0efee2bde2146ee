//! Security core
//!
//! Authentication resolves credentials (password, digest challenge,
//! bearer token) into a user record; authorization evaluates role-based
//! path rules. The [`SecurityContext`] is stateless: the authenticated
//! user is carried by the request or call context, never stored here.

pub mod role;
pub mod token;
pub mod user;

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;

use crate::error::{AuthKind, Error, Result};
use crate::path::StoragePath;
use crate::storage::root::RootStorage;

pub use role::{Auto, Permission, Role};
pub use user::User;

/// Authentication and authorization service
pub struct SecurityContext {
    root: Arc<RootStorage>,
    realm: String,
    token_stale_minutes: i64,
}

impl SecurityContext {
    pub fn new(root: Arc<RootStorage>, realm: impl Into<String>, token_stale_minutes: i64) -> Self {
        Self {
            root,
            realm: realm.into(),
            token_stale_minutes,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Issue a server nonce for digest challenges
    pub fn nonce(&self) -> String {
        token::create_nonce()
    }

    /// Check a client-presented nonce for recency
    pub fn verify_nonce(&self, nonce: &str) -> Result<()> {
        token::verify_nonce(nonce, self.token_stale_minutes)
    }

    /// Look up a user record by id
    pub async fn find_user(&self, id: &str) -> Result<Option<Arc<User>>> {
        let path: StoragePath = match format!("/user/{}", id).parse() {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        Ok(self
            .root
            .load(&path)
            .await?
            .and_then(|obj| obj.downcast_arc::<User>()))
    }

    /// Authenticate with a plaintext password
    pub async fn auth_by_password(&self, id: &str, plaintext: &str) -> Result<Arc<User>> {
        let user = self
            .find_user(id)
            .await?
            .ok_or(Error::Auth(AuthKind::UnknownUser))?;
        if !user.is_enabled() {
            return Err(Error::Auth(AuthKind::Disabled));
        }
        if !user.verify_password(plaintext) {
            return Err(Error::Auth(AuthKind::BadCredential));
        }
        Ok(user)
    }

    /// Authenticate with a digest challenge response
    ///
    /// The caller assembles `suffix` from the scheme-specific parts; the
    /// expected digest must equal `MD5(passwordHash + suffix)`.
    pub async fn auth_by_hash_challenge(
        &self,
        id: &str,
        suffix: &str,
        expected: &str,
    ) -> Result<Arc<User>> {
        let user = self
            .find_user(id)
            .await?
            .ok_or(Error::Auth(AuthKind::UnknownUser))?;
        if !user.is_enabled() {
            return Err(Error::Auth(AuthKind::Disabled));
        }
        if !user.verify_hash_challenge(suffix, expected) {
            return Err(Error::Auth(AuthKind::BadCredential));
        }
        Ok(user)
    }

    /// Authenticate with a bearer credential (native token or JWT)
    pub async fn auth_by_token(&self, credential: &str) -> Result<Arc<User>> {
        let id = token::token_subject(credential).ok_or(Error::Auth(AuthKind::BadCredential))?;
        let user = self
            .find_user(&id)
            .await?
            .ok_or(Error::Auth(AuthKind::UnknownUser))?;
        if token::is_jwt(credential) {
            token::validate_jwt(&user, credential)?;
        } else {
            token::validate_auth_token(&user, credential)?;
        }
        Ok(user)
    }

    /// Check whether a user (or anonymous caller) may access a path
    ///
    /// The user's own roles are consulted first, in declaration order,
    /// then automatic roles: `auto=all` applies to every caller,
    /// `auto=auth` to any authenticated one. The first role producing a
    /// decision wins.
    pub async fn has_access(
        &self,
        user: Option<&User>,
        path: &str,
        permission: Permission,
        via: Option<&str>,
        call_stack: &[String],
    ) -> Result<bool> {
        let mut seen: HashSet<String> = HashSet::new();
        if let Some(user) = user {
            for role_id in user.role_ids() {
                seen.insert(role_id.clone());
                if let Some(role) = self.find_role(&role_id).await? {
                    if let Some(decision) = role.check_access(path, permission, via, call_stack)
                    {
                        return Ok(decision);
                    }
                }
            }
        }

        let prefix: StoragePath = "/role/".parse().expect("valid role prefix");
        let metas: Vec<_> = self.root.query(&prefix).collect().await;
        for meta in metas {
            let role_id = meta
                .path
                .segments()
                .iter()
                .skip(1)
                .cloned()
                .collect::<Vec<_>>()
                .join("/");
            if seen.contains(&role_id) {
                continue;
            }
            let Some(role) = self.find_role(&role_id).await? else {
                continue;
            };
            let applies = match role.auto() {
                Auto::All => true,
                Auto::Auth => user.is_some(),
                Auto::None => false,
            };
            if !applies {
                continue;
            }
            if let Some(decision) = role.check_access(path, permission, via, call_stack) {
                return Ok(decision);
            }
        }
        Ok(false)
    }

    async fn find_role(&self, id: &str) -> Result<Option<Arc<Role>>> {
        let path: StoragePath = match format!("/role/{}", id).parse() {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        Ok(self
            .root
            .load(&path)
            .await?
            .and_then(|obj| obj.downcast_arc::<Role>()))
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("realm", &self.realm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::dict::{Dict, Value};
    use crate::storage::mem::MemStorage;
    use crate::storage::InitContext;
    use crate::types::TypeRegistry;
    use chrono::{Duration, Utc};

    fn path(s: &str) -> StoragePath {
        s.parse().unwrap()
    }

    fn user_dict(id: &str, password: &str, roles: &[&str]) -> Dict {
        let mut d = Dict::new();
        d.set("id", id)
            .set("type", "user")
            .set("realm", "Plexus")
            .set("enabled", true)
            .set(
                ".password",
                user::password_hash(id, "Plexus", password).as_str(),
            )
            .set(
                "role",
                roles.iter().map(|r| Value::from(*r)).collect::<Vec<_>>(),
            );
        d
    }

    fn role_dict(id: &str, auto: &str, access: Vec<(&str, &str)>) -> Dict {
        let rules: Vec<Value> = access
            .into_iter()
            .map(|(p, perm)| {
                let mut r = Dict::new();
                r.set("path", p).set("permission", perm);
                Value::Dict(r)
            })
            .collect();
        let mut d = Dict::new();
        d.set("id", id).set("type", "role").set("auto", auto).set("access", rules);
        d
    }

    async fn security_with(objects: Vec<(String, Dict)>) -> SecurityContext {
        let root = Arc::new(RootStorage::new(
            Arc::new(TypeRegistry::with_builtins()),
            InitContext::new(LimitsConfig::default()),
        ));
        let mem = Arc::new(MemStorage::new());
        for (p, d) in objects {
            mem.seed(path(&p), d);
        }
        root.mount(mem, path("/storage/test/")).unwrap();
        root.remount(&path("/storage/test/"), false, Some(path("/")), 0)
            .unwrap();
        SecurityContext::new(root, "Plexus", 240)
    }

    #[tokio::test]
    async fn test_auth_by_password() {
        let security = security_with(vec![(
            "/user/alice".into(),
            user_dict("alice", "secret", &[]),
        )])
        .await;

        let user = security.auth_by_password("alice", "secret").await.unwrap();
        assert_eq!(user.id(), "alice");

        assert!(matches!(
            security.auth_by_password("alice", "wrong").await,
            Err(Error::Auth(AuthKind::BadCredential))
        ));
        assert!(matches!(
            security.auth_by_password("ghost", "secret").await,
            Err(Error::Auth(AuthKind::UnknownUser))
        ));
    }

    #[tokio::test]
    async fn test_auth_disabled_user() {
        let mut dict = user_dict("bob", "pw", &[]);
        dict.set("enabled", false);
        let security = security_with(vec![("/user/bob".into(), dict)]).await;
        assert!(matches!(
            security.auth_by_password("bob", "pw").await,
            Err(Error::Auth(AuthKind::Disabled))
        ));
    }

    #[tokio::test]
    async fn test_auth_by_token_both_formats() {
        let security = security_with(vec![(
            "/user/alice".into(),
            user_dict("alice", "secret", &[]),
        )])
        .await;
        let user = security.find_user("alice").await.unwrap().unwrap();
        let expiry = Utc::now() + Duration::hours(1);

        let native = token::create_auth_token(&user, expiry);
        assert_eq!(security.auth_by_token(&native).await.unwrap().id(), "alice");

        let jwt = token::create_jwt(&user, expiry).unwrap();
        assert_eq!(security.auth_by_token(&jwt).await.unwrap().id(), "alice");

        assert!(security.auth_by_token("garbage").await.is_err());
    }

    #[tokio::test]
    async fn test_auth_by_hash_challenge() {
        let security = security_with(vec![(
            "/user/alice".into(),
            user_dict("alice", "secret", &[]),
        )])
        .await;
        let user = security.find_user("alice").await.unwrap().unwrap();
        let suffix = ":12345:cn:auth:uri-digest";
        let expected = user::md5_hex(&format!("{}{}", user.password_hash(), suffix));

        let authed = security
            .auth_by_hash_challenge("alice", suffix, &expected)
            .await
            .unwrap();
        assert_eq!(authed.id(), "alice");

        assert!(security
            .auth_by_hash_challenge("alice", suffix, "bad")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_has_access_user_roles() {
        let security = security_with(vec![
            (
                "/user/alice".into(),
                user_dict("alice", "pw", &["operator"]),
            ),
            (
                "/role/operator".into(),
                role_dict("operator", "none", vec![("procedure/demo/**", "read")]),
            ),
        ])
        .await;
        let user = security.find_user("alice").await.unwrap().unwrap();

        assert!(security
            .has_access(Some(&user), "procedure/demo/hello", Permission::Read, None, &[])
            .await
            .unwrap());
        assert!(!security
            .has_access(Some(&user), "procedure/admin/x", Permission::Read, None, &[])
            .await
            .unwrap());
        assert!(!security
            .has_access(Some(&user), "procedure/demo/hello", Permission::Write, None, &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_auto_all_applies_to_anonymous() {
        let security = security_with(vec![(
            "/role/public".into(),
            role_dict("public", "all", vec![("webservice/**", "read")]),
        )])
        .await;
        assert!(security
            .has_access(None, "webservice/docs", Permission::Read, None, &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_auto_auth_requires_user() {
        let security = security_with(vec![
            ("/user/alice".into(), user_dict("alice", "pw", &[])),
            (
                "/role/members".into(),
                role_dict("members", "auth", vec![("procedure/**", "read")]),
            ),
        ])
        .await;
        let user = security.find_user("alice").await.unwrap().unwrap();

        assert!(security
            .has_access(Some(&user), "procedure/x", Permission::Read, None, &[])
            .await
            .unwrap());
        assert!(!security
            .has_access(None, "procedure/x", Permission::Read, None, &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_deny_rule_beats_later_auto_allow() {
        let security = security_with(vec![
            (
                "/user/alice".into(),
                user_dict("alice", "pw", &["restricted"]),
            ),
            (
                "/role/restricted".into(),
                role_dict("restricted", "none", vec![("procedure/admin/**", "none")]),
            ),
            (
                "/role/anyone".into(),
                role_dict("anyone", "all", vec![("procedure/**", "all")]),
            ),
        ])
        .await;
        let user = security.find_user("alice").await.unwrap().unwrap();

        // alice's own role denies before the auto role can allow
        assert!(!security
            .has_access(Some(&user), "procedure/admin/reset", Permission::Read, None, &[])
            .await
            .unwrap());
        // anonymous callers never see the deny rule
        assert!(security
            .has_access(None, "procedure/admin/reset", Permission::Read, None, &[])
            .await
            .unwrap());
    }
}
