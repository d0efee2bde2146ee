//! Web service handlers
//!
//! A web service is a storage object under `/webservice/` owning a list
//! of matchers and a handler. Concrete wire handlers (file trees, app
//! surfaces, WebDAV) live outside the kernel; the kernel ships the
//! status handler used for health checks and as the boot-time default.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::dict::Dict;
use crate::error::Result;
use crate::storage::{ObjectCore, StorableObject};

use super::dispatcher::{RequestScope, WebDispatcher};
use super::matcher::{RequestInfo, WebMatcher};

/// Handler behavior contract
#[async_trait]
pub trait WebService: Send + Sync {
    /// Matchers routing requests to this service
    fn matchers(&self) -> Vec<WebMatcher>;

    /// HTTP methods the handler implements (upper-case)
    ///
    /// `OPTIONS` is always answered by the dispatcher, and `HEAD` is
    /// derived automatically when `GET` is present.
    fn methods(&self, request: &RequestInfo) -> Vec<String>;

    /// Handle a routed request
    async fn process(
        &self,
        dispatcher: &WebDispatcher,
        scope: &mut RequestScope,
        request: &RequestInfo,
    ) -> Result<Response>;
}

/// Handler variants the kernel can instantiate itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    /// JSON status summary
    Status,
    /// Type has no kernel handler (concrete handlers are plug-in turf)
    Unsupported,
}

impl HandlerKind {
    fn for_type(object_type: &str) -> Self {
        match object_type {
            "webservice/status" => Self::Status,
            _ => Self::Unsupported,
        }
    }
}

/// A storage-backed web service
pub struct WebServiceObject {
    core: ObjectCore,
    handler: HandlerKind,
    matchers: OnceLock<Vec<WebMatcher>>,
}

impl WebServiceObject {
    /// Constructor registered under the `webservice` initializer symbol
    pub fn create(id: &str, object_type: &str, dict: Dict) -> Result<Arc<dyn StorableObject>> {
        Ok(Arc::new(Self {
            core: ObjectCore::new(id, object_type, dict),
            handler: HandlerKind::for_type(object_type),
            matchers: OnceLock::new(),
        }))
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }
}

impl StorableObject for WebServiceObject {
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

#[async_trait]
impl WebService for WebServiceObject {
    fn matchers(&self) -> Vec<WebMatcher> {
        self.matchers
            .get_or_init(|| {
                self.core.with_dict(|d| {
                    d.array("match")
                        .map(|entries| {
                            entries
                                .iter()
                                .filter_map(|v| v.as_dict())
                                .map(WebMatcher::from_dict)
                                .collect()
                        })
                        .unwrap_or_default()
                })
            })
            .clone()
    }

    fn methods(&self, _request: &RequestInfo) -> Vec<String> {
        match self.handler {
            HandlerKind::Status => vec!["GET".to_string()],
            HandlerKind::Unsupported => Vec::new(),
        }
    }

    async fn process(
        &self,
        dispatcher: &WebDispatcher,
        scope: &mut RequestScope,
        _request: &RequestInfo,
    ) -> Result<Response> {
        match self.handler {
            HandlerKind::Status => {
                let mut status = Dict::new();
                status
                    .set("id", self.core.id())
                    .set("time", chrono::Utc::now())
                    .set("mounts", dispatcher.storage().mount_info().len() as i64)
                    .set("cachedObjects", dispatcher.storage().cached_count() as i64);
                if let Some(user) = &scope.user {
                    status.set("user", user.id());
                }
                Ok((
                    StatusCode::OK,
                    [("content-type", "application/json")],
                    status.to_public_json(),
                )
                    .into_response())
            }
            HandlerKind::Unsupported => Ok((
                StatusCode::NOT_IMPLEMENTED,
                format!("no handler for web service type {}", self.core.object_type()),
            )
                .into_response()),
        }
    }
}

impl std::fmt::Debug for WebServiceObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebServiceObject")
            .field("id", &self.core.id())
            .field("handler", &self.handler)
            .finish()
    }
}
