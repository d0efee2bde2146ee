//! Procedure call interceptor chain
//!
//! Every call runs through an ordered chain of interceptors. The default
//! chain is *security* (role check on the procedure path) → *compile*
//! (type-specific preparation) → *execute* (frame push, cancellation
//! checkpoint, the body itself). The chain is immutable once built;
//! rebuilding happens on reset.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::dict::Value;
use crate::error::{Error, ProcedureKind, Result};
use crate::security::Permission;

use super::{CallBindings, CallContext, Procedure};

/// One filter in the call chain
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Handle the call, usually delegating to `chain.proceed(next, ..)`
    async fn call(
        &self,
        chain: &InterceptorChain,
        next: usize,
        cx: &mut CallContext,
        procedure: &Arc<dyn Procedure>,
        bindings: &CallBindings,
    ) -> Result<Value>;
}

/// An ordered, shareable interceptor chain
#[derive(Clone)]
pub struct InterceptorChain {
    list: Arc<Vec<Arc<dyn Interceptor>>>,
}

impl InterceptorChain {
    pub fn new(list: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            list: Arc::new(list),
        }
    }

    /// The standard chain: security, compile, execute
    pub fn default_chain() -> Self {
        Self::new(vec![
            Arc::new(SecurityInterceptor),
            Arc::new(CompileInterceptor),
            Arc::new(ExecuteInterceptor),
        ])
    }

    /// Run a call through the whole chain
    pub fn run<'a>(
        &'a self,
        cx: &'a mut CallContext,
        procedure: &'a Arc<dyn Procedure>,
        bindings: &'a CallBindings,
    ) -> BoxFuture<'a, Result<Value>> {
        self.proceed(0, cx, procedure, bindings)
    }

    /// Continue the chain at `index`
    pub fn proceed<'a>(
        &'a self,
        index: usize,
        cx: &'a mut CallContext,
        procedure: &'a Arc<dyn Procedure>,
        bindings: &'a CallBindings,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match self.list.get(index) {
                Some(interceptor) => {
                    interceptor
                        .call(self, index + 1, cx, procedure, bindings)
                        .await
                }
                // an exhausted chain falls through to the body directly
                None => procedure.call(cx, bindings).await,
            }
        })
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.list.len())
            .finish()
    }
}

/// Enforces read access on the procedure path
///
/// The caller path is the procedure currently on top of the stack (none
/// at the root call), so role rules can be scoped to call sites.
pub struct SecurityInterceptor;

#[async_trait]
impl Interceptor for SecurityInterceptor {
    async fn call(
        &self,
        chain: &InterceptorChain,
        next: usize,
        cx: &mut CallContext,
        procedure: &Arc<dyn Procedure>,
        bindings: &CallBindings,
    ) -> Result<Value> {
        let path = procedure.path();
        let caller = cx.caller_path().map(str::to_string);
        let allowed = cx
            .security()
            .clone()
            .has_access(
                cx.user().map(|u| u.as_ref()),
                &path,
                Permission::Read,
                caller.as_deref(),
                cx.call_stack(),
            )
            .await?;
        if !allowed {
            cx.trace(format!("access denied: {}", path));
            return Err(Error::Forbidden(format!("procedure {}", procedure.id())));
        }
        chain.proceed(next, cx, procedure, bindings).await
    }
}

/// Runs the procedure's preparation hook before execution
pub struct CompileInterceptor;

#[async_trait]
impl Interceptor for CompileInterceptor {
    async fn call(
        &self,
        chain: &InterceptorChain,
        next: usize,
        cx: &mut CallContext,
        procedure: &Arc<dyn Procedure>,
        bindings: &CallBindings,
    ) -> Result<Value> {
        procedure.compile(cx).await?;
        chain.proceed(next, cx, procedure, bindings).await
    }
}

/// Terminal interceptor: frame bookkeeping and the body itself
pub struct ExecuteInterceptor;

#[async_trait]
impl Interceptor for ExecuteInterceptor {
    async fn call(
        &self,
        _chain: &InterceptorChain,
        _next: usize,
        cx: &mut CallContext,
        procedure: &Arc<dyn Procedure>,
        bindings: &CallBindings,
    ) -> Result<Value> {
        if cx.is_cancelled() {
            return Err(Error::procedure(ProcedureKind::Cancelled, "call cancelled"));
        }
        cx.trace(format!("call {}", procedure.id()));
        cx.push_frame(procedure.path());
        let result = procedure.call(cx, bindings).await;
        cx.pop_frame();
        match &result {
            Ok(_) => cx.trace(format!("done {}", procedure.id())),
            Err(e) => cx.trace(format!("fail {}: {}", procedure.id(), e)),
        }
        result
    }
}
