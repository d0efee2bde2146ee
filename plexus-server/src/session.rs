//! Session store
//!
//! Sessions are ordinary storage objects under `/session/`. Validity is
//! carried entirely by `destroyTime`: a session is live while that instant
//! is in the future, and every authenticated access pushes it out by the
//! configured lifetime (30 minutes anonymous, 30 days authenticated by
//! default). Once a session is bound to a user it stays bound; re-binding
//! to a different id is an error.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dict::{Dict, Value};
use crate::error::{Error, Result};
use crate::path::StoragePath;
use crate::storage::root::RootStorage;
use crate::storage::{ObjectCore, StorableObject};

/// Hidden dict key tracking per-session temporary files
const FILES_KEY: &str = ".files";

/// A storage-backed session record
pub struct Session {
    core: ObjectCore,
}

impl Session {
    /// Constructor registered under the `session` initializer symbol
    pub fn create(id: &str, object_type: &str, dict: Dict) -> Result<Arc<dyn StorableObject>> {
        Ok(Arc::new(Self {
            core: ObjectCore::new(id, object_type, dict),
        }))
    }

    /// Start a new session, stamping creation and expiry times
    pub fn new_session(
        user: Option<&str>,
        ip: &str,
        client: &str,
        ttl_anon_secs: i64,
        ttl_auth_secs: i64,
    ) -> Arc<Session> {
        let id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let ttl = if user.is_some() {
            ttl_auth_secs
        } else {
            ttl_anon_secs
        };
        let mut dict = Dict::new();
        dict.set("id", id.as_str())
            .set("type", "session")
            .set("user", user.unwrap_or(""))
            .set("createTime", now)
            .set("accessTime", now)
            .set("destroyTime", now + Duration::seconds(ttl))
            .set("ip", ip)
            .set("client", client);
        let session = Self {
            core: ObjectCore::new(&id, "session", dict),
        };
        session.core.mark_modified();
        Arc::new(session)
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    /// Bound user id, or `None` while anonymous
    pub fn user(&self) -> Option<String> {
        self.core.with_dict(|d| {
            let user = d.str_or("user", "");
            if user.is_empty() {
                None
            } else {
                Some(user.to_string())
            }
        })
    }

    pub fn ip(&self) -> String {
        self.core.with_dict(|d| d.str_or("ip", "").to_string())
    }

    pub fn access_time(&self) -> DateTime<Utc> {
        self.core
            .with_dict(|d| d.time("accessTime"))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn destroy_time(&self) -> DateTime<Utc> {
        self.core
            .with_dict(|d| d.time("destroyTime"))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// True while the session has not reached its destroy time
    pub fn is_valid(&self) -> bool {
        self.destroy_time() > Utc::now()
    }

    /// Bind the session to an authenticated user
    ///
    /// A session bound to one user can never be re-bound to another; the
    /// web layer creates a fresh session instead.
    pub fn bind_user(&self, user_id: &str, ttl_auth_secs: i64) -> Result<()> {
        if let Some(existing) = self.user() {
            if existing != user_id {
                return Err(Error::BadRequest(format!(
                    "session already bound to {}",
                    existing
                )));
            }
            return Ok(());
        }
        let now = Utc::now();
        self.core.update(|d| {
            d.set("user", user_id)
                .set("accessTime", now)
                .set("destroyTime", now + Duration::seconds(ttl_auth_secs));
        });
        Ok(())
    }

    /// Refresh the access stamp and push the expiry out
    pub fn update_access_time(&self, ttl_anon_secs: i64, ttl_auth_secs: i64) {
        let ttl = if self.user().is_some() {
            ttl_auth_secs
        } else {
            ttl_anon_secs
        };
        let now = Utc::now();
        self.core.update(|d| {
            d.set("accessTime", now)
                .set("destroyTime", now + Duration::seconds(ttl));
        });
    }

    /// Expire the session immediately
    pub fn invalidate(&self) {
        let now = Utc::now();
        self.core.update(|d| {
            d.set("destroyTime", now);
        });
    }

    /// Track a temporary file for deletion when the session dies
    pub fn add_file(&self, path: &std::path::Path) {
        let entry = Value::from(path.to_string_lossy().into_owned());
        self.core.update(|d| {
            let mut files = d.array(FILES_KEY).map(<[Value]>::to_vec).unwrap_or_default();
            files.push(entry);
            d.set(FILES_KEY, files);
        });
    }

    /// Storage path for a session id
    pub fn storage_path(id: &str) -> StoragePath {
        StoragePath::object(["session", id])
    }

    /// Delete expired sessions and sessions of missing or disabled users
    ///
    /// Returns the number of sessions removed. Individual failures are
    /// logged and skipped; the sweep keeps going.
    pub async fn remove_expired(root: &RootStorage) -> Result<usize> {
        let prefix: StoragePath = "/session/".parse().expect("valid session prefix");
        let metas: Vec<_> = root.query(&prefix).collect().await;
        let now = Utc::now();
        let mut removed = 0;
        for meta in metas {
            let Ok(Some(dict)) = root.load_dict(&meta.path).await else {
                continue;
            };
            let expired = dict
                .time("destroyTime")
                .map(|t| t <= now)
                .unwrap_or(true);
            let mut dead_user = false;
            let user_id = dict.str_or("user", "").to_string();
            if !expired && !user_id.is_empty() {
                let user_path: StoragePath = match format!("/user/{}", user_id).parse() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                dead_user = match root.load(&user_path).await {
                    Ok(Some(obj)) => obj
                        .downcast::<crate::security::User>()
                        .map(|u| !u.is_enabled())
                        .unwrap_or(true),
                    Ok(None) => true,
                    Err(_) => false,
                };
            }
            if expired || dead_user {
                match root.remove(&meta.path).await {
                    Ok(()) => {
                        removed += 1;
                        debug!(session = %meta.path, expired, dead_user, "session removed");
                    }
                    Err(e) => warn!(session = %meta.path, error = %e, "session sweep failed"),
                }
            }
        }
        Ok(removed)
    }
}

impl StorableObject for Session {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    /// Deletes any tracked temporary files
    fn destroy(&self) {
        let files: Vec<String> = self.core.with_dict(|d| {
            d.str_array(FILES_KEY)
                .into_iter()
                .map(str::to_string)
                .collect()
        });
        for file in files {
            if let Err(e) = std::fs::remove_file(&file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(%file, error = %e, "session temp file not deleted");
                }
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id())
            .field("user", &self.user())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::security::user::password_hash;
    use crate::storage::mem::MemStorage;
    use crate::storage::InitContext;
    use crate::types::TypeRegistry;

    const ANON: i64 = 30 * 60;
    const AUTH: i64 = 30 * 24 * 60 * 60;

    #[test]
    fn test_new_session_stamps_times() {
        let session = Session::new_session(None, "127.0.0.1", "test", ANON, AUTH);
        assert!(session.is_valid());
        assert!(session.user().is_none());
        assert_eq!(session.id().len(), 32);

        let delta = session.destroy_time() - session.access_time();
        assert_eq!(delta.num_seconds(), ANON);
    }

    #[test]
    fn test_authenticated_session_gets_long_ttl() {
        let session = Session::new_session(Some("admin"), "127.0.0.1", "test", ANON, AUTH);
        let delta = session.destroy_time() - session.access_time();
        assert_eq!(delta.num_seconds(), AUTH);
    }

    #[test]
    fn test_bind_user_extends_and_sticks() {
        let session = Session::new_session(None, "127.0.0.1", "test", ANON, AUTH);
        session.bind_user("admin", AUTH).unwrap();
        assert_eq!(session.user().as_deref(), Some("admin"));
        let delta = session.destroy_time() - session.access_time();
        assert_eq!(delta.num_seconds(), AUTH);

        // same user is a no-op, different user is an error
        session.bind_user("admin", AUTH).unwrap();
        assert!(session.bind_user("other", AUTH).is_err());
        assert_eq!(session.user().as_deref(), Some("admin"));
    }

    #[test]
    fn test_update_access_time_tracks_user_state() {
        let session = Session::new_session(None, "127.0.0.1", "test", ANON, AUTH);
        session.update_access_time(ANON, AUTH);
        assert_eq!(
            (session.destroy_time() - session.access_time()).num_seconds(),
            ANON
        );
        session.bind_user("admin", AUTH).unwrap();
        session.update_access_time(ANON, AUTH);
        assert_eq!(
            (session.destroy_time() - session.access_time()).num_seconds(),
            AUTH
        );
    }

    #[test]
    fn test_invalidate() {
        let session = Session::new_session(None, "127.0.0.1", "test", ANON, AUTH);
        session.invalidate();
        assert!(!session.is_valid());
    }

    #[test]
    fn test_destroy_removes_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("upload.bin");
        std::fs::write(&file, b"data").unwrap();

        let session = Session::new_session(None, "127.0.0.1", "test", ANON, AUTH);
        session.add_file(&file);
        session.destroy();
        assert!(!file.exists());
    }

    async fn sweep_fixture() -> (Arc<RootStorage>, Arc<MemStorage>) {
        let root = Arc::new(RootStorage::new(
            Arc::new(TypeRegistry::with_builtins()),
            InitContext::new(LimitsConfig::default()),
        ));
        let mem = Arc::new(MemStorage::new());
        root.mount(mem.clone(), "/storage/test/".parse().unwrap())
            .unwrap();
        root.remount(
            &"/storage/test/".parse().unwrap(),
            false,
            Some(StoragePath::root()),
            0,
        )
        .unwrap();
        (root, mem)
    }

    fn session_dict(id: &str, user: &str, destroy_in_secs: i64) -> Dict {
        let now = Utc::now();
        let mut d = Dict::new();
        d.set("id", id)
            .set("type", "session")
            .set("user", user)
            .set("createTime", now)
            .set("accessTime", now)
            .set("destroyTime", now + Duration::seconds(destroy_in_secs));
        d
    }

    #[tokio::test]
    async fn test_remove_expired_sweep() {
        let (root, mem) = sweep_fixture().await;
        let mut enabled = Dict::new();
        enabled
            .set("id", "alice")
            .set("type", "user")
            .set("enabled", true)
            .set(".password", password_hash("alice", "Plexus", "pw").as_str());
        let mut disabled = Dict::new();
        disabled.set("id", "bob").set("type", "user").set("enabled", false);

        mem.seed("/user/alice".parse::<StoragePath>().unwrap(), enabled);
        mem.seed("/user/bob".parse::<StoragePath>().unwrap(), disabled);
        mem.seed(
            Session::storage_path("live"),
            session_dict("live", "alice", 3600),
        );
        mem.seed(
            Session::storage_path("anon"),
            session_dict("anon", "", 3600),
        );
        mem.seed(
            Session::storage_path("expired"),
            session_dict("expired", "alice", -10),
        );
        mem.seed(
            Session::storage_path("orphan"),
            session_dict("orphan", "ghost", 3600),
        );
        mem.seed(
            Session::storage_path("locked"),
            session_dict("locked", "bob", 3600),
        );

        let removed = Session::remove_expired(&root).await.unwrap();
        assert_eq!(removed, 3);
        assert!(root
            .load_dict(&Session::storage_path("live"))
            .await
            .unwrap()
            .is_some());
        assert!(root
            .load_dict(&Session::storage_path("anon"))
            .await
            .unwrap()
            .is_some());
        assert!(root
            .load_dict(&Session::storage_path("expired"))
            .await
            .unwrap()
            .is_none());
        assert!(root
            .load_dict(&Session::storage_path("orphan"))
            .await
            .unwrap()
            .is_none());
        assert!(root
            .load_dict(&Session::storage_path("locked"))
            .await
            .unwrap()
            .is_none());
    }
}
