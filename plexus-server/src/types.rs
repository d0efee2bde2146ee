//! Type registry
//!
//! Stored objects carry a `type` tag; type records under `/type/` map tags
//! to *initializer* symbols, and this registry maps symbols to constructor
//! functions. The `type` type itself is bootstrapped: type records load as
//! raw dicts without consulting the registry, so the registry can read its
//! own configuration through storage.

use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::path::StoragePath;
use crate::storage::root::RootStorage;
use crate::storage::{GenericObject, StorableObject};

/// Constructor resolved from an initializer symbol
pub type Initializer = fn(&str, &str, Dict) -> Result<Arc<dyn StorableObject>>;

/// Maps initializer symbols to constructors and resolves stored type tags
pub struct TypeRegistry {
    symbols: DashMap<String, Initializer>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            symbols: DashMap::new(),
        }
    }

    /// Registry pre-loaded with the kernel's built-in constructors
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("user", crate::security::user::User::create);
        registry.register("role", crate::security::role::Role::create);
        registry.register("session", crate::session::Session::create);
        registry.register("connection", crate::connection::Connection::create);
        registry.register("procedure", crate::procedure::StoredProcedure::create);
        registry.register("webservice", crate::web::service::WebServiceObject::create);
        registry
    }

    /// Register (or replace) an initializer symbol
    ///
    /// Plug-ins use this to contribute constructors for their types.
    pub fn register(&self, symbol: impl Into<String>, init: Initializer) {
        self.symbols.insert(symbol.into(), init);
    }

    pub fn unregister(&self, symbol: &str) {
        self.symbols.remove(symbol);
    }

    pub fn symbol(&self, name: &str) -> Option<Initializer> {
        self.symbols.get(name).map(|f| *f)
    }

    /// Construct the typed object for a stored dictionary
    ///
    /// Resolution order: the type record chain (the tag, then each parent
    /// tag) looking for an `initializer` symbol, then a registered symbol
    /// matching the tag directly, then an alias scan over `/type/`.
    /// `remote` types and unresolved tags fall back to a raw dict object.
    pub async fn construct(
        &self,
        root: &RootStorage,
        path: &StoragePath,
        dict: Dict,
    ) -> Result<Arc<dyn StorableObject>> {
        let object_type = dict
            .get_str("type")
            .map(str::to_string)
            .unwrap_or_else(|| default_type(path));
        let id = dict
            .get_str("id")
            .map(str::to_string)
            .unwrap_or_else(|| default_id(path));

        let mut tag: Option<&str> = Some(&object_type);
        while let Some(cur) = tag {
            if let Some(record) = load_type_record(root, cur).await? {
                if record.bool_or("remote", false) {
                    return Ok(GenericObject::new(&id, &object_type, dict));
                }
                if let Some(symbol) = record.get_str("initializer") {
                    let init = self.symbol(symbol).ok_or_else(|| {
                        Error::bad_object(
                            path,
                            format!("unregistered initializer symbol: {}", symbol),
                        )
                    })?;
                    return init(&id, &object_type, dict);
                }
            } else if let Some(init) = self.symbol(cur) {
                return init(&id, &object_type, dict);
            }
            tag = parent_type(cur);
        }

        if let Some(record) = find_alias_record(root, &object_type).await {
            if let Some(symbol) = record.get_str("initializer") {
                if let Some(init) = self.symbol(symbol) {
                    return init(&id, &object_type, dict);
                }
            }
        }

        Ok(GenericObject::new(&id, &object_type, dict))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Type tag derived from an object's path (leading segment)
fn default_type(path: &StoragePath) -> String {
    path.segments().first().cloned().unwrap_or_default()
}

/// Object id derived from its path (everything after the type segment)
fn default_id(path: &StoragePath) -> String {
    let segments = path.segments();
    if segments.len() > 1 {
        segments[1..].join("/")
    } else {
        segments.first().cloned().unwrap_or_default()
    }
}

/// Parent of a hierarchical type tag (`connection/http` -> `connection`)
fn parent_type(tag: &str) -> Option<&str> {
    tag.rfind('/').map(|pos| &tag[..pos])
}

async fn load_type_record(root: &RootStorage, tag: &str) -> Result<Option<Dict>> {
    let path: StoragePath = match format!("/type/{}", tag).parse() {
        Ok(p) => p,
        Err(_) => return Ok(None),
    };
    root.load_dict(&path).await
}

/// Scan `/type/` for a record whose `alias` matches the tag
async fn find_alias_record(root: &RootStorage, tag: &str) -> Option<Dict> {
    let prefix: StoragePath = "/type/".parse().ok()?;
    let entries: Vec<_> = root.query(&prefix).collect().await;
    for meta in entries {
        if let Ok(Some(record)) = root.load_dict(&meta.path).await {
            if record.get_str("alias") == Some(tag) {
                return Some(record);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::storage::mem::MemStorage;
    use crate::storage::InitContext;

    fn path(s: &str) -> StoragePath {
        s.parse().unwrap()
    }

    async fn root_with(entries: Vec<(&str, Dict)>) -> RootStorage {
        let root = RootStorage::new(
            Arc::new(TypeRegistry::with_builtins()),
            InitContext::new(LimitsConfig::default()),
        );
        let mem = Arc::new(MemStorage::new());
        for (p, d) in entries {
            mem.seed(path(p), d);
        }
        root.mount(mem, path("/storage/test/")).unwrap();
        root.remount(&path("/storage/test/"), false, Some(path("/")), 0)
            .unwrap();
        root
    }

    #[test]
    fn test_parent_type() {
        assert_eq!(parent_type("connection/http"), Some("connection"));
        assert_eq!(parent_type("connection"), None);
    }

    #[test]
    fn test_path_derived_defaults() {
        assert_eq!(default_type(&path("/procedure/demo/hello")), "procedure");
        assert_eq!(default_id(&path("/procedure/demo/hello")), "demo/hello");
        assert_eq!(default_id(&path("/config")), "config");
    }

    #[tokio::test]
    async fn test_unknown_type_falls_back_to_generic() {
        let root = root_with(vec![]).await;
        let mut dict = Dict::new();
        dict.set("id", "x").set("type", "mystery/kind");
        let registry = TypeRegistry::with_builtins();
        let obj = registry
            .construct(&root, &path("/mystery/x"), dict)
            .await
            .unwrap();
        assert!(obj.downcast::<GenericObject>().is_some());
        assert_eq!(obj.core().object_type(), "mystery/kind");
    }

    #[tokio::test]
    async fn test_builtin_symbol_used_without_type_record() {
        let root = root_with(vec![]).await;
        let mut dict = Dict::new();
        dict.set("id", "alice").set("type", "user");
        let registry = TypeRegistry::with_builtins();
        let obj = registry
            .construct(&root, &path("/user/alice"), dict)
            .await
            .unwrap();
        assert_eq!(obj.core().object_type(), "user");
        assert!(obj.downcast::<GenericObject>().is_none());
    }

    #[tokio::test]
    async fn test_type_record_resolves_parent_symbol() {
        let mut record = Dict::new();
        record.set("id", "connection/custom")
            .set("type", "type")
            .set("initializer", "connection");
        let root = root_with(vec![("/type/connection/custom", record)]).await;

        let mut dict = Dict::new();
        dict.set("id", "c1").set("type", "connection/custom");
        let registry = TypeRegistry::with_builtins();
        let obj = registry
            .construct(&root, &path("/connection/c1"), dict)
            .await
            .unwrap();
        assert_eq!(obj.core().object_type(), "connection/custom");
    }

    #[tokio::test]
    async fn test_remote_type_stays_raw() {
        let mut record = Dict::new();
        record.set("id", "widget").set("type", "type").set("remote", true);
        let root = root_with(vec![("/type/widget", record)]).await;

        let mut dict = Dict::new();
        dict.set("id", "w").set("type", "widget");
        let registry = TypeRegistry::with_builtins();
        let obj = registry
            .construct(&root, &path("/widget/w"), dict)
            .await
            .unwrap();
        assert!(obj.downcast::<GenericObject>().is_some());
    }

    #[tokio::test]
    async fn test_unregistered_symbol_is_bad_object() {
        let mut record = Dict::new();
        record.set("id", "widget").set("type", "type").set("initializer", "nope");
        let root = root_with(vec![("/type/widget", record)]).await;

        let mut dict = Dict::new();
        dict.set("id", "w").set("type", "widget");
        let registry = TypeRegistry::with_builtins();
        let err = registry.construct(&root, &path("/widget/w"), dict).await;
        assert!(matches!(err, Err(Error::BadObject { .. })));
    }

    #[tokio::test]
    async fn test_alias_lookup() {
        let mut record = Dict::new();
        record.set("id", "account")
            .set("type", "type")
            .set("alias", "legacy-account")
            .set("initializer", "user");
        let root = root_with(vec![("/type/account", record)]).await;

        let mut dict = Dict::new();
        dict.set("id", "a").set("type", "legacy-account");
        let registry = TypeRegistry::with_builtins();
        let obj = registry
            .construct(&root, &path("/account/a"), dict)
            .await
            .unwrap();
        assert!(obj.downcast::<GenericObject>().is_none());
    }
}
