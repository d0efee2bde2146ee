//! Web request dispatcher
//!
//! The per-request pipeline: resolve the cookie session (expired ones are
//! dropped), otherwise parse an `Authorization` header (Digest, Token or
//! Bearer), score the matcher table, dispatch to the winning service, then
//! write the session back and record the user metric. The active user and
//! session live in a per-request [`RequestScope`] that is threaded through
//! explicitly; nothing request-scoped is ambient.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{HeaderMap, ALLOW, AUTHORIZATION, COOKIE, SET_COOKIE, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::path::StoragePath;
use crate::procedure::Library;
use crate::security::user::md5_hex;
use crate::security::{SecurityContext, User};
use crate::session::Session;
use crate::storage::root::RootStorage;
use crate::storage::StorableObject;

use super::matcher::{select_best, RequestInfo, WebMatcher};
use super::service::{WebService, WebServiceObject};

/// Request-scoped authentication state
#[derive(Default)]
pub struct RequestScope {
    pub user: Option<Arc<User>>,
    pub session: Option<Arc<Session>>,
    /// Session created during this request; emits a cookie
    pub new_session: bool,
    /// Presented session was invalid; clears the cookie
    pub clear_session: bool,
}

struct MatcherEntry {
    matcher: WebMatcher,
    service: Arc<WebServiceObject>,
}

/// Routes requests through the matcher table to web services
pub struct WebDispatcher {
    root: Arc<RootStorage>,
    security: Arc<SecurityContext>,
    library: Arc<Library>,
    config: Config,
    matchers: RwLock<Arc<Vec<MatcherEntry>>>,
}

impl WebDispatcher {
    pub fn new(
        root: Arc<RootStorage>,
        security: Arc<SecurityContext>,
        library: Arc<Library>,
        config: Config,
    ) -> Self {
        Self {
            root,
            security,
            library,
            config,
            matchers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn storage(&self) -> &Arc<RootStorage> {
        &self.root
    }

    pub fn security(&self) -> &Arc<SecurityContext> {
        &self.security
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Rebuild the matcher cache from `/webservice/` storage
    ///
    /// Called at boot and after every plug-in change or reset; request
    /// handling only ever reads the cached snapshot, so a rebuild swaps
    /// all new matchers in at once.
    pub async fn rebuild_matchers(&self) -> Result<()> {
        let prefix: StoragePath = "/webservice/".parse().expect("valid webservice prefix");
        let metas: Vec<_> = self.root.query(&prefix).collect().await;
        let mut entries = Vec::new();
        for meta in metas {
            let Some(obj) = self.root.load(&meta.path).await? else {
                continue;
            };
            let Some(service) = obj.downcast_arc::<WebServiceObject>() else {
                continue;
            };
            for matcher in service.matchers() {
                entries.push(MatcherEntry {
                    matcher,
                    service: service.clone(),
                });
            }
        }
        debug!(matchers = entries.len(), "matcher cache rebuilt");
        *self.matchers.write().expect("matcher cache lock poisoned") = Arc::new(entries);
        Ok(())
    }

    pub fn matcher_count(&self) -> usize {
        self.matchers
            .read()
            .expect("matcher cache lock poisoned")
            .len()
    }

    /// Entry point for the HTTP server
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let (parts, _body) = request.into_parts();
        let info = request_info(&parts.method.to_string(), parts.uri.path(), &parts.headers);
        self.dispatch(info, &parts.headers).await
    }

    /// Run the full pipeline for a resolved request
    ///
    /// Cookie cleanup and the user metric are unconditional final steps:
    /// a rejected `Authorization` header still clears a stale session
    /// cookie and shows up in the metrics.
    pub async fn dispatch(&self, info: RequestInfo, headers: &HeaderMap) -> Response {
        let started = Instant::now();
        let mut scope = RequestScope::default();

        let mut response = match self.resolve_caller(&mut scope, &info, headers).await {
            Ok(()) => self.route(&mut scope, &info).await,
            Err(response) => *response,
        };
        self.finish_session(&mut scope, &mut response).await;

        let subject = match &scope.user {
            Some(user) => format!("user/{}", user.id()),
            None => "user/anonymous".to_string(),
        };
        let success = response.status().is_success() || response.status().is_redirection();
        let error = if success {
            None
        } else {
            Some(response.status().to_string())
        };
        self.root.init_context().metrics.report(
            &subject,
            started.elapsed(),
            success,
            error.as_deref(),
        );
        response
    }

    /// First pipeline stage: session cookie, then `Authorization` header
    ///
    /// Authentication failures yield the challenge response (boxed to
    /// keep the happy path small), skipping matcher dispatch; the
    /// sub-cause never reaches the client.
    async fn resolve_caller(
        &self,
        scope: &mut RequestScope,
        info: &RequestInfo,
        headers: &HeaderMap,
    ) -> std::result::Result<(), Box<Response>> {
        if let Some(session_id) = self.cookie_value(headers) {
            match self.resolve_session(&session_id).await {
                Ok(Some((session, user))) => {
                    scope.session = Some(session);
                    scope.user = user;
                    return Ok(());
                }
                Ok(None) => {
                    scope.clear_session = true;
                }
                Err(e) => {
                    warn!("session resolution failed: {}", e);
                    scope.clear_session = true;
                }
            }
        }

        let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
            return Ok(());
        };
        let outcome = if let Some(params) = auth.strip_prefix("Digest ") {
            self.auth_digest(info, params).await
        } else if let Some(token) = auth.strip_prefix("Token ") {
            self.security.auth_by_token(token.trim()).await
        } else if let Some(token) = auth.strip_prefix("Bearer ") {
            self.security.auth_by_token(token.trim()).await
        } else {
            Err(Error::BadRequest("unsupported authorization scheme".into()))
        };
        match outcome {
            Ok(user) => {
                info!(user = user.id(), "request authenticated");
                scope.user = Some(user);
                Ok(())
            }
            Err(e) => {
                // failed authentication leaves no user or session behind
                scope.user = None;
                scope.session = None;
                info!("authentication rejected: {}", e);
                Err(Box::new(self.challenge_response()))
            }
        }
    }

    /// HTTP Digest verification (algorithm=MD5, qop=auth)
    async fn auth_digest(&self, info: &RequestInfo, params: &str) -> Result<Arc<User>> {
        let params = parse_auth_params(params);
        let get = |key: &str| params.get(key).map(String::as_str).unwrap_or("");
        let nonce = get("nonce");
        self.security.verify_nonce(nonce)?;
        let uri = get("uri");
        let ha2 = md5_hex(&format!("{}:{}", info.method, uri));
        let suffix = format!(
            ":{}:{}:{}:{}:{}",
            nonce,
            get("nc"),
            get("cnonce"),
            get("qop"),
            ha2
        );
        self.security
            .auth_by_hash_challenge(get("username"), &suffix, get("response"))
            .await
    }

    /// Steps 3 and onward: matcher selection and method handling
    async fn route(&self, scope: &mut RequestScope, info: &RequestInfo) -> Response {
        let entries = self.matchers.read().expect("matcher cache lock poisoned").clone();
        let mut selected = select_best(
            entries.iter().enumerate().map(|(i, e)| (i, &e.matcher)),
            info,
        );
        // HEAD falls back onto GET matchers (the body is dropped later)
        if selected.is_none() && info.method == "HEAD" {
            let mut as_get = info.clone();
            as_get.method = "GET".to_string();
            selected = select_best(
                entries.iter().enumerate().map(|(i, e)| (i, &e.matcher)),
                &as_get,
            );
        }
        let Some(index) = selected else {
            return (StatusCode::NOT_FOUND, format!("Not found: {}", info.path)).into_response();
        };
        let entry = &entries[index];
        if entry.matcher.auth && scope.user.is_none() {
            return self.challenge_response();
        }

        let service = &entry.service;
        let implemented: Vec<String> = service.methods(info);
        let allow = allow_header(service, &implemented);

        if info.method == "OPTIONS" {
            return ([(ALLOW, allow)], StatusCode::NO_CONTENT).into_response();
        }
        if info.method == "HEAD" && implemented.iter().any(|m| m == "GET") {
            let mut get_info = info.clone();
            get_info.method = "GET".to_string();
            let response = match service.process(self, scope, &get_info).await {
                Ok(response) => response,
                Err(e) => e.into_response(),
            };
            let (mut parts, _body) = response.into_parts();
            parts.headers.remove(axum::http::header::CONTENT_LENGTH);
            return Response::from_parts(parts, Body::empty());
        }
        if !implemented.iter().any(|m| m == &info.method) {
            return (StatusCode::METHOD_NOT_ALLOWED, [(ALLOW, allow)], "Method not allowed")
                .into_response();
        }

        match service.process(self, scope, info).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    /// Final pipeline stage: session write-back and cookie headers
    async fn finish_session(&self, scope: &mut RequestScope, response: &mut Response) {
        if let Some(session) = &scope.session {
            session.update_access_time(
                self.config.limits.session_ttl_anon_secs,
                self.config.limits.session_ttl_auth_secs,
            );
            let path = Session::storage_path(session.id());
            if let Err(e) = self.root.store(&path, session.serialize()).await {
                warn!(session = session.id(), "session write-back failed: {}", e);
            } else {
                session.core().clear_modified();
            }
            if scope.new_session {
                self.append_cookie(response, session.id(), false);
            }
        } else if scope.clear_session {
            self.append_cookie(response, "", true);
        }
        scope.user = None;
        scope.session = None;
    }

    /// Resolve a presented session id to a live session and its user
    ///
    /// Returns `None` when the session is missing, expired, or bound to a
    /// user that no longer exists or is disabled.
    async fn resolve_session(
        &self,
        session_id: &str,
    ) -> Result<Option<(Arc<Session>, Option<Arc<User>>)>> {
        let path = Session::storage_path(session_id);
        let Some(obj) = self.root.load(&path).await? else {
            return Ok(None);
        };
        let Some(session) = obj.downcast_arc::<Session>() else {
            return Ok(None);
        };
        if !session.is_valid() {
            return Ok(None);
        }
        match session.user() {
            Some(user_id) => match self.security.find_user(&user_id).await? {
                Some(user) if user.is_enabled() => Ok(Some((session, Some(user)))),
                _ => Ok(None),
            },
            None => Ok(Some((session, None))),
        }
    }

    /// Create and bind a session for a just-authenticated user
    ///
    /// For handlers implementing login; the cookie is emitted when the
    /// request finishes.
    pub fn start_session(&self, scope: &mut RequestScope, info: &RequestInfo) -> Arc<Session> {
        let session = Session::new_session(
            scope.user.as_ref().map(|u| u.id()),
            &info.ip,
            &info.client,
            self.config.limits.session_ttl_anon_secs,
            self.config.limits.session_ttl_auth_secs,
        );
        scope.session = Some(session.clone());
        scope.new_session = true;
        scope.clear_session = false;
        session
    }

    fn cookie_value(&self, headers: &HeaderMap) -> Option<String> {
        let cookies = headers.get(COOKIE)?.to_str().ok()?;
        let name = &self.config.web.cookie_name;
        cookies.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            if key == name && !value.is_empty() {
                Some(value.to_string())
            } else {
                None
            }
        })
    }

    fn append_cookie(&self, response: &mut Response, value: &str, expire: bool) {
        let mut cookie = format!(
            "{}={}; Path={}; HttpOnly",
            self.config.web.cookie_name, value, self.config.web.cookie_path
        );
        if let Some(domain) = &self.config.web.cookie_domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        if expire {
            cookie.push_str("; Max-Age=0");
        }
        if let Ok(header) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, header);
        }
    }

    /// A 401 with the digest challenge header
    fn challenge_response(&self) -> Response {
        let challenge = format!(
            "Digest realm=\"{}\", nonce=\"{}\"",
            self.security.realm(),
            self.security.nonce()
        );
        let mut response =
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        if let Ok(header) = HeaderValue::from_str(&challenge) {
            response.headers_mut().insert(WWW_AUTHENTICATE, header);
        }
        response
    }
}

impl std::fmt::Debug for WebDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebDispatcher")
            .field("matchers", &self.matcher_count())
            .finish()
    }
}

/// Allowed methods for a service: implemented ∪ matcher methods ∪
/// OPTIONS, plus HEAD when GET exists
fn allow_header(service: &WebServiceObject, implemented: &[String]) -> String {
    let mut allowed: BTreeSet<String> = implemented.iter().cloned().collect();
    for matcher in service.matchers() {
        if let Some(method) = matcher.method {
            allowed.insert(method);
        }
    }
    if allowed.contains("GET") {
        allowed.insert("HEAD".to_string());
    }
    allowed.insert("OPTIONS".to_string());
    allowed.into_iter().collect::<Vec<_>>().join(", ")
}

/// Build request facts from HTTP parts
fn request_info(method: &str, path: &str, headers: &HeaderMap) -> RequestInfo {
    let mut info = RequestInfo::new(method, path);
    if let Some(host) = headers.get(axum::http::header::HOST).and_then(|v| v.to_str().ok()) {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                info.host = name.to_string();
                info.port = port.parse().unwrap_or(0);
            }
            _ => info.host = host.to_string(),
        }
    }
    if let Some(agent) = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
    {
        info.client = agent.to_string();
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        info.ip = forwarded.split(',').next().unwrap_or("").trim().to_string();
    }
    info
}

/// Parse comma-separated `key=value` authorization parameters
fn parse_auth_params(params: &str) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    for part in params.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            out.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::dict::{Dict, Value};
    use crate::security::token::create_auth_token;
    use crate::security::user::password_hash;
    use crate::storage::mem::MemStorage;
    use crate::storage::InitContext;
    use crate::types::TypeRegistry;
    use chrono::{Duration, Utc};

    fn path(s: &str) -> StoragePath {
        s.parse().unwrap()
    }

    fn service_dict(id: &str, matchers: Vec<(&str, Option<&str>, bool)>) -> Dict {
        let list: Vec<Value> = matchers
            .into_iter()
            .map(|(p, m, auth)| {
                let mut d = Dict::new();
                d.set("path", p).set("auth", auth);
                if let Some(m) = m {
                    d.set("method", m);
                }
                Value::Dict(d)
            })
            .collect();
        let mut d = Dict::new();
        d.set("id", id).set("type", "webservice/status").set("match", list);
        d
    }

    async fn dispatcher_with(objects: Vec<(String, Dict)>) -> Arc<WebDispatcher> {
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

        let security = Arc::new(SecurityContext::new(root.clone(), "Plexus", 240));
        let library = Arc::new(Library::new(root.clone()));
        let dispatcher = Arc::new(WebDispatcher::new(
            root,
            security,
            library,
            Config::default(),
        ));
        dispatcher.rebuild_matchers().await.unwrap();
        dispatcher
    }

    #[tokio::test]
    async fn test_route_selection_prefers_specific_matcher() {
        let dispatcher = dispatcher_with(vec![
            (
                "/webservice/api".into(),
                service_dict("api", vec![("/api/", None, false)]),
            ),
            (
                "/webservice/users".into(),
                service_dict("users", vec![("/api/users", Some("GET"), false)]),
            ),
        ])
        .await;
        assert_eq!(dispatcher.matcher_count(), 2);

        let response = dispatcher
            .dispatch(RequestInfo::new("GET", "/api/users/42"), &HeaderMap::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = dispatcher
            .dispatch(RequestInfo::new("POST", "/api/users"), &HeaderMap::new())
            .await;
        // the broad service matched; status services only implement GET
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let allow = response.headers().get(ALLOW).unwrap().to_str().unwrap();
        assert!(allow.contains("GET"));
        assert!(allow.contains("OPTIONS"));
    }

    #[tokio::test]
    async fn test_unmatched_request_is_404() {
        let dispatcher = dispatcher_with(vec![(
            "/webservice/api".into(),
            service_dict("api", vec![("/api/", None, false)]),
        )])
        .await;
        let response = dispatcher
            .dispatch(RequestInfo::new("GET", "/other"), &HeaderMap::new())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_options_and_head_are_automatic() {
        let dispatcher = dispatcher_with(vec![(
            "/webservice/api".into(),
            service_dict("api", vec![("/api/", None, false)]),
        )])
        .await;

        let response = dispatcher
            .dispatch(RequestInfo::new("OPTIONS", "/api/x"), &HeaderMap::new())
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let allow = response.headers().get(ALLOW).unwrap().to_str().unwrap();
        assert!(allow.contains("HEAD"));

        let response = dispatcher
            .dispatch(RequestInfo::new("HEAD", "/api/x"), &HeaderMap::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_auth_matcher_challenges_anonymous() {
        let dispatcher = dispatcher_with(vec![(
            "/webservice/admin".into(),
            service_dict("admin", vec![("/admin/", None, true)]),
        )])
        .await;
        let response = dispatcher
            .dispatch(RequestInfo::new("GET", "/admin/panel"), &HeaderMap::new())
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(challenge.starts_with("Digest realm=\"Plexus\", nonce=\""));
    }

    fn user_dict(id: &str, password: &str) -> Dict {
        let mut d = Dict::new();
        d.set("id", id)
            .set("type", "user")
            .set("realm", "Plexus")
            .set("enabled", true)
            .set(".password", password_hash(id, "Plexus", password).as_str());
        d
    }

    #[tokio::test]
    async fn test_bearer_token_authenticates() {
        let dispatcher = dispatcher_with(vec![
            ("/user/alice".into(), user_dict("alice", "pw")),
            (
                "/webservice/admin".into(),
                service_dict("admin", vec![("/admin/", None, true)]),
            ),
        ])
        .await;
        let user = dispatcher.security().find_user("alice").await.unwrap().unwrap();
        let token = create_auth_token(&user, Utc::now() + Duration::hours(1));

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Token {}", token)).unwrap(),
        );
        let response = dispatcher
            .dispatch(RequestInfo::new("GET", "/admin/panel"), &headers)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bad_token_gets_challenge() {
        let dispatcher = dispatcher_with(vec![
            ("/user/alice".into(), user_dict("alice", "pw")),
            (
                "/webservice/api".into(),
                service_dict("api", vec![("/api/", None, false)]),
            ),
        ])
        .await;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer nonsense"));
        let response = dispatcher
            .dispatch(RequestInfo::new("GET", "/api/x"), &headers)
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_auth_failure_still_clears_cookie_and_records_metric() {
        let now = Utc::now();
        let mut session = Dict::new();
        session
            .set("id", "s3")
            .set("type", "session")
            .set("user", "alice")
            .set("createTime", now - Duration::hours(2))
            .set("accessTime", now - Duration::hours(1))
            .set("destroyTime", now - Duration::minutes(1));

        let dispatcher = dispatcher_with(vec![
            ("/user/alice".into(), user_dict("alice", "pw")),
            ("/session/s3".into(), session),
            (
                "/webservice/api".into(),
                service_dict("api", vec![("/api/", None, false)]),
            ),
        ])
        .await;

        // a stale cookie plus a rejected bearer credential
        let mut headers = session_cookie(&dispatcher, "s3");
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer nonsense"));
        let response = dispatcher
            .dispatch(RequestInfo::new("GET", "/api/x"), &headers)
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // the stale cookie is cleared even though auth failed
        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(cookie.contains("Max-Age=0"));

        // and the 401 shows up in the anonymous user metric
        let metrics = &dispatcher.storage().init_context().metrics;
        let snapshot = metrics.snapshot("user/anonymous").unwrap();
        assert_eq!(snapshot.int_or("count", 0), 1);
        assert_eq!(snapshot.int_or("errors", 0), 1);
    }

    fn session_cookie(dispatcher: &WebDispatcher, id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!(
                "{}={}",
                dispatcher.config().web.cookie_name, id
            ))
            .unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_session_cookie_round_trip() {
        let now = Utc::now();
        let mut session = Dict::new();
        session
            .set("id", "s1")
            .set("type", "session")
            .set("user", "alice")
            .set("createTime", now)
            .set("accessTime", now)
            .set("destroyTime", now + Duration::minutes(10));

        let dispatcher = dispatcher_with(vec![
            ("/user/alice".into(), user_dict("alice", "pw")),
            ("/session/s1".into(), session),
            (
                "/webservice/admin".into(),
                service_dict("admin", vec![("/admin/", None, true)]),
            ),
        ])
        .await;

        let headers = session_cookie(&dispatcher, "s1");
        let response = dispatcher
            .dispatch(RequestInfo::new("GET", "/admin/x"), &headers)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        // the access-time write-back extended the authenticated expiry
        let stored = dispatcher
            .storage()
            .load_dict(&path("/session/s1"))
            .await
            .unwrap()
            .unwrap();
        let access = stored.time("accessTime").unwrap();
        let destroy = stored.time("destroyTime").unwrap();
        assert_eq!(
            (destroy - access).num_seconds(),
            dispatcher.config().limits.session_ttl_auth_secs
        );
    }

    #[tokio::test]
    async fn test_expired_session_is_cleared_and_challenged() {
        let now = Utc::now();
        let mut session = Dict::new();
        session
            .set("id", "s2")
            .set("type", "session")
            .set("user", "alice")
            .set("createTime", now - Duration::hours(2))
            .set("accessTime", now - Duration::hours(1))
            .set("destroyTime", now - Duration::minutes(29));

        let dispatcher = dispatcher_with(vec![
            ("/user/alice".into(), user_dict("alice", "pw")),
            ("/session/s2".into(), session),
            (
                "/webservice/admin".into(),
                service_dict("admin", vec![("/admin/", None, true)]),
            ),
        ])
        .await;

        let headers = session_cookie(&dispatcher, "s2");
        let response = dispatcher
            .dispatch(RequestInfo::new("GET", "/admin/x"), &headers)
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(cookie.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn test_digest_auth_flow() {
        let dispatcher = dispatcher_with(vec![
            ("/user/alice".into(), user_dict("alice", "pw")),
            (
                "/webservice/admin".into(),
                service_dict("admin", vec![("/admin/", None, true)]),
            ),
        ])
        .await;
        let user = dispatcher.security().find_user("alice").await.unwrap().unwrap();

        let nonce = dispatcher.security().nonce();
        let uri = "/admin/x";
        let ha2 = md5_hex(&format!("GET:{}", uri));
        let response_digest = md5_hex(&format!(
            "{}:{}:00000001:abcdef:auth:{}",
            user.password_hash(),
            nonce,
            ha2
        ));
        let header = format!(
            "Digest username=\"alice\", realm=\"Plexus\", nonce=\"{}\", uri=\"{}\", nc=00000001, cnonce=\"abcdef\", qop=auth, response=\"{}\", algorithm=MD5",
            nonce, uri, response_digest
        );
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&header).unwrap());

        let response = dispatcher
            .dispatch(RequestInfo::new("GET", uri), &headers)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_parse_auth_params() {
        let parsed = parse_auth_params(
            "username=\"alice\", realm=\"Plexus\", nc=00000001, qop=auth",
        );
        assert_eq!(parsed.get("username").unwrap(), "alice");
        assert_eq!(parsed.get("nc").unwrap(), "00000001");
        assert_eq!(parsed.get("qop").unwrap(), "auth");
    }

    #[test]
    fn test_request_info_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::HOST,
            HeaderValue::from_static("example.com:8080"),
        );
        headers.insert(
            axum::http::header::USER_AGENT,
            HeaderValue::from_static("test-agent"),
        );
        let info = request_info("GET", "/x", &headers);
        assert_eq!(info.host, "example.com");
        assert_eq!(info.port, 8080);
        assert_eq!(info.client, "test-agent");
    }
}
