//! Procedure call context
//!
//! One `CallContext` exists per top-level call. It owns the call stack,
//! the attribute map, the trace buffer and the set of reserved channels,
//! and is only ever touched by the request task driving the call. Nested
//! calls run in the same context; channels reserved anywhere in the call
//! are released together when the top-level frame pops, in reverse
//! acquisition order, with commit on success and rollback on failure.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::connection::{Channel, ChannelLease, Connection};
use crate::dict::{Dict, Value};
use crate::error::{Error, ProcedureKind, Result};
use crate::path::StoragePath;
use crate::security::{SecurityContext, User};
use crate::storage::root::RootStorage;

use super::{BindingKind, CallBindings, Library, Procedure};

/// How a finished call settles its reserved channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    /// Commit, release back to the pool
    Commit,
    /// Roll back, release back to the pool
    Rollback,
    /// Roll back and destroy; cancellation must not repool channels
    Discard,
}

struct ReservedChannel {
    connection_id: String,
    lease: ChannelLease,
}

/// Per-call state threaded through interceptors and procedure bodies
pub struct CallContext {
    root: Arc<RootStorage>,
    library: Arc<Library>,
    security: Arc<SecurityContext>,
    user: Option<Arc<User>>,
    environment: Option<Dict>,
    attributes: Dict,
    stack: Vec<String>,
    reserved: Vec<ReservedChannel>,
    cancel: CancellationToken,
    trace: Option<Vec<String>>,
    max_depth: usize,
}

impl CallContext {
    pub fn new(
        root: Arc<RootStorage>,
        library: Arc<Library>,
        security: Arc<SecurityContext>,
    ) -> Self {
        let max_depth = root.init_context().limits.max_call_depth;
        Self {
            root,
            library,
            security,
            user: None,
            environment: None,
            attributes: Dict::new(),
            stack: Vec::new(),
            reserved: Vec::new(),
            cancel: CancellationToken::new(),
            trace: None,
            max_depth,
        }
    }

    pub fn with_user(mut self, user: Option<Arc<User>>) -> Self {
        if let Some(user) = &user {
            self.attributes.set("user", user.id());
        }
        self.user = user;
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.attributes.set("source", source);
        self
    }

    pub fn with_environment(mut self, environment: Option<Dict>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_trace(mut self) -> Self {
        self.trace = Some(Vec::new());
        self
    }

    pub fn storage(&self) -> &Arc<RootStorage> {
        &self.root
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    pub fn security(&self) -> &Arc<SecurityContext> {
        &self.security
    }

    pub fn user(&self) -> Option<&Arc<User>> {
        self.user.as_ref()
    }

    pub fn attributes(&self) -> &Dict {
        &self.attributes
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) {
        self.attributes.set(key, value);
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Procedure paths currently on the call stack, outermost first
    pub fn call_stack(&self) -> &[String] {
        &self.stack
    }

    /// Path of the procedure currently executing (`None` at the root)
    pub fn caller_path(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    pub(crate) fn push_frame(&mut self, path: String) {
        self.stack.push(path);
    }

    pub(crate) fn pop_frame(&mut self) {
        self.stack.pop();
    }

    /// Append a structured line to the trace buffer, if tracing is on
    pub fn trace(&mut self, line: impl Into<String>) {
        if let Some(buffer) = &mut self.trace {
            let depth = self.stack.len();
            buffer.push(format!("{}{}", "  ".repeat(depth), line.into()));
        }
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace.is_some()
    }

    pub fn trace_output(&self) -> Option<String> {
        self.trace.as_ref().map(|lines| lines.join("\n"))
    }

    /// Execute a top-level procedure call
    ///
    /// Runs the call, settles all reserved channels and records the
    /// procedure metric. Channel settlement failures on an otherwise
    /// successful call surface as the call's error.
    pub async fn execute(&mut self, name: &str, args: Dict) -> Result<Value> {
        let started = Instant::now();
        let result = self.call(name, args).await;

        let settlement = match &result {
            Ok(_) => Settlement::Commit,
            Err(Error::Procedure {
                kind: ProcedureKind::Cancelled,
                ..
            }) => Settlement::Discard,
            Err(_) => Settlement::Rollback,
        };
        let settled = self.release_all(settlement).await;

        let subject = format!("procedure/{}", name);
        let metrics = self.root.init_context().metrics.clone();
        match &result {
            Ok(_) => metrics.report(&subject, started.elapsed(), true, None),
            Err(e) => metrics.report(&subject, started.elapsed(), false, Some(&e.to_string())),
        }

        match (result, settled) {
            (Ok(value), Ok(())) => {
                self.attributes.set("result", value.clone());
                Ok(value)
            }
            (Ok(_), Err(e)) => {
                self.attributes.set("error", e.to_string());
                Err(e)
            }
            (Err(e), _) => {
                self.attributes.set("error", e.to_string());
                Err(e)
            }
        }
    }

    /// Execute a nested procedure call within this context
    ///
    /// Used by procedure bodies; reserved channels stay reserved until the
    /// top-level call settles them.
    pub async fn call(&mut self, name: &str, args: Dict) -> Result<Value> {
        if self.is_cancelled() {
            return Err(Error::procedure(ProcedureKind::Cancelled, "call cancelled"));
        }
        if self.stack.len() >= self.max_depth {
            return Err(Error::procedure(
                ProcedureKind::Recursion,
                format!("call stack depth limit ({}) exceeded", self.max_depth),
            ));
        }
        let procedure = self
            .library
            .clone()
            .find(name)
            .await?
            .ok_or_else(|| {
                Error::procedure(ProcedureKind::NotFound, format!("no procedure {}", name))
            })?;
        if let Some(note) = procedure.deprecated() {
            warn!(procedure = name, "deprecated procedure called: {}", note);
            self.trace(format!("deprecated: {}", note));
        }
        let bindings = self.resolve_bindings(procedure.as_ref(), &args).await?;
        let chain = self.library.chain().clone();
        chain.run(self, &procedure, &bindings).await
    }

    /// Resolve declared bindings against arguments and storage
    ///
    /// Data values are vault-expanded constants; procedure references are
    /// verified to exist; connection bindings stay as ids and are only
    /// reserved on first use.
    async fn resolve_bindings(
        &mut self,
        procedure: &dyn Procedure,
        args: &Dict,
    ) -> Result<CallBindings> {
        let vaults = self.root.init_context().vaults.clone();
        let mut out = CallBindings::default();
        for binding in procedure.bindings().iter() {
            match binding.kind {
                BindingKind::Data => {
                    out.push(
                        &binding.name,
                        BindingKind::Data,
                        Value::from(vaults.expand_str(&binding.value)),
                    );
                }
                BindingKind::Argument => {
                    let value = args.get(&binding.name).cloned().unwrap_or(Value::Null);
                    out.push(&binding.name, BindingKind::Argument, value);
                }
                BindingKind::Procedure => {
                    let target = if binding.value.is_empty() {
                        &binding.name
                    } else {
                        &binding.value
                    };
                    if self.library.clone().find(target).await?.is_none() {
                        return Err(Error::procedure(
                            ProcedureKind::Binding,
                            format!(
                                "binding {} references unknown procedure {}",
                                binding.name, target
                            ),
                        ));
                    }
                    out.push(
                        &binding.name,
                        BindingKind::Procedure,
                        Value::from(target.as_str()),
                    );
                }
                BindingKind::Connection => {
                    out.push(
                        &binding.name,
                        BindingKind::Connection,
                        Value::from(vaults.expand_str(&binding.value)),
                    );
                }
            }
        }
        Ok(out)
    }

    /// Reserve (or share) a channel on the named connection
    ///
    /// Each connection is reserved at most once per call: a second
    /// request reuses the held channel when it allows sharing, and fails
    /// otherwise. The borrow observes cancellation.
    pub async fn connection(&mut self, id: &str) -> Result<Arc<dyn Channel>> {
        if self.is_cancelled() {
            return Err(Error::procedure(ProcedureKind::Cancelled, "call cancelled"));
        }
        let (resolved_id, connection) = self.resolve_connection(id).await?;
        if let Some(reserved) = self
            .reserved
            .iter()
            .find(|r| r.connection_id == resolved_id)
        {
            if reserved.lease.is_shared() {
                let channel = reserved.lease.channel().clone();
                self.trace(format!("sharing channel on {}", resolved_id));
                return Ok(channel);
            }
            return Err(Error::Channel(format!(
                "connection {} already reserved with a non-shareable channel",
                resolved_id
            )));
        }

        let cancel = self.cancel.clone();
        let lease = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::procedure(ProcedureKind::Cancelled, "call cancelled"));
            }
            lease = connection.reserve() => lease?,
        };
        self.trace(format!("reserved channel on {}", resolved_id));
        let channel = lease.channel().clone();
        self.reserved.push(ReservedChannel {
            connection_id: resolved_id,
            lease,
        });
        Ok(channel)
    }

    /// Reserve the channel declared by a connection binding
    pub async fn connection_for(
        &mut self,
        bindings: &CallBindings,
        name: &str,
    ) -> Result<Arc<dyn Channel>> {
        let id = bindings
            .connection_id(name)
            .ok_or_else(|| {
                Error::procedure(
                    ProcedureKind::Binding,
                    format!("no connection binding named {}", name),
                )
            })?
            .to_string();
        self.connection(&id).await
    }

    /// Resolve a connection id through the environment prefix
    ///
    /// An environment may scope lookups with a `connectionPath` prefix;
    /// without one (or with an empty one) the global `/connection/<id>`
    /// tree is used directly.
    async fn resolve_connection(&self, id: &str) -> Result<(String, Arc<Connection>)> {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(env) = &self.environment {
            let prefix = env.str_or("connectionPath", "");
            if !prefix.is_empty() {
                candidates.push(format!(
                    "{}/{}",
                    prefix.trim_end_matches('/').trim_start_matches('/'),
                    id
                ));
            }
        }
        candidates.push(format!("connection/{}", id));

        for candidate in &candidates {
            let path: StoragePath = match format!("/{}", candidate).parse() {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Some(obj) = self.root.load(&path).await? {
                if let Some(connection) = obj.downcast_arc::<Connection>() {
                    let resolved = candidate
                        .strip_prefix("connection/")
                        .unwrap_or(candidate)
                        .to_string();
                    return Ok((resolved, connection));
                }
            }
        }
        Err(Error::procedure(
            ProcedureKind::Binding,
            format!("no connection {}", id),
        ))
    }

    /// Number of channels currently reserved by this call
    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    /// Settle and release every reserved channel, reverse order
    ///
    /// Commits precede releases; rollbacks replace commits on failure.
    /// Release-side errors are logged and do not mask the call's primary
    /// error, but a commit failure on a successful call is returned.
    async fn release_all(&mut self, settlement: Settlement) -> Result<()> {
        let mut first_commit_error = None;
        while let Some(reserved) = self.reserved.pop() {
            let channel = reserved.lease.channel().clone();
            match settlement {
                Settlement::Commit => {
                    if let Err(e) = channel.commit().await {
                        warn!(connection = %reserved.connection_id, "commit failed: {}", e);
                        first_commit_error.get_or_insert(e);
                    }
                }
                Settlement::Rollback | Settlement::Discard => {
                    if let Err(e) = channel.rollback().await {
                        warn!(connection = %reserved.connection_id, "rollback failed: {}", e);
                    }
                }
            }
            let pool = reserved.lease.pool();
            match settlement {
                Settlement::Discard => pool.discard(reserved.lease, "call cancelled").await,
                _ => pool.give_back(reserved.lease).await,
            }
        }
        match first_commit_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("user", &self.user.as_ref().map(|u| u.id().to_string()))
            .field("stack", &self.stack)
            .field("reserved", &self.reserved.len())
            .finish()
    }
}
