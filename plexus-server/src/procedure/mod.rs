//! Procedure library
//!
//! Named server-side procedures come in two flavors: code-defined
//! built-ins registered directly with the [`Library`], and storage-defined
//! procedures under `/procedure/` instantiated through the type registry.
//! Storage-defined procedures delegate their body to a
//! [`ProcedureExecutor`] registered for their type tag (script engines and
//! the like live outside the kernel).

pub mod context;
pub mod interceptor;

use std::any::Any;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;

use crate::dict::{Dict, Value};
use crate::error::{Error, ProcedureKind, Result};
use crate::path::StoragePath;
use crate::storage::root::RootStorage;
use crate::storage::{ObjectCore, StorableObject};

pub use context::CallContext;
pub use interceptor::{
    CompileInterceptor, ExecuteInterceptor, Interceptor, InterceptorChain, SecurityInterceptor,
};

/// Input kinds a procedure binding may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// Constant value resolved at call start
    Data,
    /// Reference to another procedure, resolved at call start
    Procedure,
    /// Connection id, reserved lazily inside the call context
    Connection,
    /// Supplied by the caller at call time
    Argument,
}

impl BindingKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "data" => Some(Self::Data),
            "procedure" => Some(Self::Procedure),
            "connection" => Some(Self::Connection),
            "argument" => Some(Self::Argument),
            _ => None,
        }
    }
}

/// One declared binding
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub kind: BindingKind,
    pub value: String,
    pub description: String,
}

/// Ordered binding declarations for a procedure
#[derive(Debug, Clone, Default)]
pub struct Bindings(Vec<Binding>);

impl Bindings {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse from a stored `binding[]` list
    pub fn from_dict(dict: &Dict) -> Self {
        let mut list = Vec::new();
        if let Some(entries) = dict.array("binding") {
            for entry in entries {
                let Some(b) = entry.as_dict() else { continue };
                let Some(kind) = BindingKind::parse(b.str_or("type", "")) else {
                    continue;
                };
                list.push(Binding {
                    name: b.str_or("name", "").to_string(),
                    kind,
                    value: b.str_or("value", "").to_string(),
                    description: b.str_or("description", "").to_string(),
                });
            }
        }
        Self(list)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.0.iter()
    }

    pub fn find(&self, name: &str) -> Option<&Binding> {
        self.0.iter().find(|b| b.name == name)
    }
}

/// Bindings resolved for one call
///
/// Data and argument values carry their resolved [`Value`]; procedure and
/// connection bindings carry the referenced name for the call context to
/// act on.
#[derive(Debug, Clone, Default)]
pub struct CallBindings {
    entries: Vec<(String, BindingKind, Value)>,
}

impl CallBindings {
    pub fn push(&mut self, name: impl Into<String>, kind: BindingKind, value: Value) {
        self.entries.push((name.into(), kind, value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, v)| v)
    }

    /// The connection id bound under `name`, if any
    pub fn connection_id(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, kind, _)| n == name && *kind == BindingKind::Connection)
            .and_then(|(_, _, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, BindingKind, &Value)> {
        self.entries.iter().map(|(n, k, v)| (n.as_str(), *k, v))
    }
}

/// A callable procedure
#[async_trait]
pub trait Procedure: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> String {
        String::new()
    }

    /// Deprecation notice, logged once per call when present
    fn deprecated(&self) -> Option<String> {
        None
    }

    fn bindings(&self) -> &Bindings;

    /// Storage path used for permission checks and via chaining
    fn path(&self) -> String {
        format!("procedure/{}", self.id())
    }

    /// Preparation hook run by the compile interceptor
    async fn compile(&self, _cx: &mut CallContext) -> Result<()> {
        Ok(())
    }

    async fn call(&self, cx: &mut CallContext, bindings: &CallBindings) -> Result<Value>;
}

/// Execution engine for a family of storage-defined procedure types
#[async_trait]
pub trait ProcedureExecutor: Send + Sync {
    async fn compile(&self, _cx: &mut CallContext, _procedure: &StoredProcedure) -> Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        cx: &mut CallContext,
        procedure: &StoredProcedure,
        bindings: &CallBindings,
    ) -> Result<Value>;
}

/// A procedure defined by a storage record
pub struct StoredProcedure {
    core: ObjectCore,
    bindings: OnceLock<Bindings>,
}

impl StoredProcedure {
    /// Constructor registered under the `procedure` initializer symbol
    pub fn create(id: &str, object_type: &str, dict: Dict) -> Result<Arc<dyn StorableObject>> {
        Ok(Arc::new(Self {
            core: ObjectCore::new(id, object_type, dict),
            bindings: OnceLock::new(),
        }))
    }

    pub fn object_type(&self) -> &str {
        self.core.object_type()
    }

    pub fn dict(&self) -> Dict {
        self.core.dict()
    }

    pub fn alias(&self) -> Option<String> {
        self.core.with_dict(|d| d.get_str("alias").map(str::to_string))
    }
}

impl StorableObject for StoredProcedure {
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
impl Procedure for StoredProcedure {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn description(&self) -> String {
        self.core
            .with_dict(|d| d.str_or("description", "").to_string())
    }

    fn deprecated(&self) -> Option<String> {
        self.core.with_dict(|d| match d.get("deprecated") {
            Some(Value::Bool(true)) => Some("procedure is deprecated".to_string()),
            Some(Value::Str(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
    }

    fn bindings(&self) -> &Bindings {
        self.bindings
            .get_or_init(|| self.core.with_dict(Bindings::from_dict))
    }

    async fn compile(&self, cx: &mut CallContext) -> Result<()> {
        let Some(executor) = cx.library().executor(self.core.object_type()) else {
            return Ok(());
        };
        executor.compile(cx, self).await
    }

    async fn call(&self, cx: &mut CallContext, bindings: &CallBindings) -> Result<Value> {
        let executor = cx
            .library()
            .executor(self.core.object_type())
            .ok_or_else(|| {
                Error::procedure(
                    ProcedureKind::Runtime,
                    format!(
                        "no executor registered for procedure type {}",
                        self.core.object_type()
                    ),
                )
            })?;
        executor.execute(cx, self, bindings).await
    }
}

/// Registry of built-in and storage-defined procedures
pub struct Library {
    root: Arc<RootStorage>,
    builtins: DashMap<String, Arc<dyn Procedure>>,
    executors: DashMap<String, Arc<dyn ProcedureExecutor>>,
    chain: InterceptorChain,
}

impl Library {
    pub fn new(root: Arc<RootStorage>) -> Self {
        let library = Self {
            root,
            builtins: DashMap::new(),
            executors: DashMap::new(),
            chain: InterceptorChain::default_chain(),
        };
        library.register_builtin(Arc::new(StatusProcedure::new()));
        library
    }

    pub fn storage(&self) -> &Arc<RootStorage> {
        &self.root
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    /// Replace the interceptor chain (rebuilt on reset)
    pub fn set_chain(&mut self, chain: InterceptorChain) {
        self.chain = chain;
    }

    pub fn register_builtin(&self, procedure: Arc<dyn Procedure>) {
        self.builtins.insert(procedure.id().to_string(), procedure);
    }

    /// Register an execution engine for a procedure type tag
    pub fn register_executor(
        &self,
        type_tag: impl Into<String>,
        executor: Arc<dyn ProcedureExecutor>,
    ) {
        self.executors.insert(type_tag.into(), executor);
    }

    /// Executor for a type tag, walking the tag hierarchy
    pub fn executor(&self, type_tag: &str) -> Option<Arc<dyn ProcedureExecutor>> {
        let mut tag = type_tag;
        loop {
            if let Some(executor) = self.executors.get(tag) {
                return Some(executor.clone());
            }
            match tag.rfind('/') {
                Some(pos) => tag = &tag[..pos],
                None => return None,
            }
        }
    }

    /// Find a procedure by name, consulting aliases on a miss
    pub async fn find(&self, name: &str) -> Result<Option<Arc<dyn Procedure>>> {
        if let Some(procedure) = self.builtins.get(name) {
            return Ok(Some(procedure.clone()));
        }
        if let Some(procedure) = self.load_stored(name).await? {
            return Ok(Some(procedure));
        }
        // alias fallback: a stored procedure may answer to a legacy name
        let prefix: StoragePath = "/procedure/".parse().expect("valid procedure prefix");
        let metas: Vec<_> = self.root.query(&prefix).collect().await;
        for meta in metas {
            if let Ok(Some(dict)) = self.root.load_dict(&meta.path).await {
                if dict.get_str("alias") == Some(name) {
                    let id = dict.str_or("id", "").to_string();
                    if let Some(procedure) = self.load_stored(&id).await? {
                        return Ok(Some(procedure));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn load_stored(&self, name: &str) -> Result<Option<Arc<dyn Procedure>>> {
        let path: StoragePath = match format!("/procedure/{}", name).parse() {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        Ok(self
            .root
            .load(&path)
            .await?
            .and_then(|obj| obj.downcast_arc::<StoredProcedure>())
            .map(|p| p as Arc<dyn Procedure>))
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let builtins: Vec<String> = self.builtins.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("Library").field("builtins", &builtins).finish()
    }
}

/// Built-in `system/status`: a summary of the running server
pub struct StatusProcedure {
    bindings: Bindings,
}

impl StatusProcedure {
    pub fn new() -> Self {
        Self {
            bindings: Bindings::empty(),
        }
    }
}

impl Default for StatusProcedure {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Procedure for StatusProcedure {
    fn id(&self) -> &str {
        "system/status"
    }

    fn description(&self) -> String {
        "Returns a server status summary".to_string()
    }

    fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    async fn call(&self, cx: &mut CallContext, _bindings: &CallBindings) -> Result<Value> {
        let config_path: StoragePath = "/config".parse().expect("valid config path");
        let config = cx.storage().load_dict(&config_path).await?.unwrap_or_default();
        let mut status = Dict::new();
        status
            .set("plugins", config.array("plugins").map(<[Value]>::to_vec).unwrap_or_default())
            .set("cachedObjects", cx.storage().cached_count() as i64)
            .set("mounts", cx.storage().mount_info().len() as i64)
            .set("time", chrono::Utc::now());
        Ok(Value::Dict(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::Value;

    #[test]
    fn test_bindings_from_dict() {
        let mut b1 = Dict::new();
        b1.set("name", "sql").set("type", "data").set("value", "SELECT 1");
        let mut b2 = Dict::new();
        b2.set("name", "db").set("type", "connection").set("value", "maindb");
        let mut b3 = Dict::new();
        b3.set("name", "limit").set("type", "argument");
        let mut b4 = Dict::new();
        b4.set("name", "bad").set("type", "mystery");
        let mut dict = Dict::new();
        dict.set(
            "binding",
            vec![
                Value::Dict(b1),
                Value::Dict(b2),
                Value::Dict(b3),
                Value::Dict(b4),
            ],
        );

        let bindings = Bindings::from_dict(&dict);
        assert_eq!(bindings.iter().count(), 3);
        assert_eq!(bindings.find("sql").unwrap().kind, BindingKind::Data);
        assert_eq!(bindings.find("db").unwrap().value, "maindb");
        assert!(bindings.find("bad").is_none());
    }

    #[test]
    fn test_call_bindings_lookup() {
        let mut bindings = CallBindings::default();
        bindings.push("db", BindingKind::Connection, Value::from("maindb"));
        bindings.push("limit", BindingKind::Argument, Value::from(10));

        assert_eq!(bindings.connection_id("db"), Some("maindb"));
        assert_eq!(bindings.connection_id("limit"), None);
        assert_eq!(bindings.get("limit").and_then(Value::as_int), Some(10));
    }

    #[test]
    fn test_stored_procedure_deprecation() {
        let mut dict = Dict::new();
        dict.set("id", "old").set("deprecated", "use new/thing instead");
        let obj = StoredProcedure::create("old", "procedure/test", dict).unwrap();
        let proc = obj.downcast::<StoredProcedure>().unwrap();
        assert_eq!(
            proc.deprecated().as_deref(),
            Some("use new/thing instead")
        );

        let mut dict = Dict::new();
        dict.set("id", "flag").set("deprecated", true);
        let obj = StoredProcedure::create("flag", "procedure/test", dict).unwrap();
        assert!(obj
            .downcast::<StoredProcedure>()
            .unwrap()
            .deprecated()
            .is_some());
    }
}
