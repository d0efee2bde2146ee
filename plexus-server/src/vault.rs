//! Secret sources and variable expansion
//!
//! String values in configuration dicts may reference external secrets
//! with the `${{[vaultId!]key[:default]}}` syntax. Expansion consults the
//! vault registry: a named vault when the id is given, otherwise every
//! registered vault in registration order. Unresolved references without a
//! default are left untouched so misconfigurations stay visible.

use std::sync::LazyLock;

use dashmap::DashMap;
use regex::Regex;

use crate::dict::{Dict, Value};

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{(?:([A-Za-z0-9_.-]+)!)?([^:!}]+)(?::([^}]*))?\}\}")
        .expect("vault variable regex is valid")
});

/// A source of named secret values
pub trait Vault: Send + Sync {
    fn id(&self) -> &str;
    fn lookup(&self, key: &str) -> Option<String>;
}

/// Vault over the process environment
#[derive(Debug, Default)]
pub struct EnvVault;

impl Vault for EnvVault {
    fn id(&self) -> &str {
        "env"
    }

    fn lookup(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Vault backed by a stored `/vault/<id>` record's `data` dict
#[derive(Debug)]
pub struct LocalVault {
    id: String,
    data: Dict,
}

impl LocalVault {
    pub fn from_dict(id: impl Into<String>, record: &Dict) -> Self {
        Self {
            id: id.into(),
            data: record.dict("data").cloned().unwrap_or_default(),
        }
    }
}

impl Vault for LocalVault {
    fn id(&self) -> &str {
        &self.id
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.data.get_str(key).map(str::to_string)
    }
}

/// Registry of vaults consulted during expansion
pub struct VaultRegistry {
    vaults: DashMap<String, std::sync::Arc<dyn Vault>>,
    order: std::sync::Mutex<Vec<String>>,
}

impl VaultRegistry {
    pub fn new() -> Self {
        let registry = Self {
            vaults: DashMap::new(),
            order: std::sync::Mutex::new(Vec::new()),
        };
        registry.register(std::sync::Arc::new(EnvVault));
        registry
    }

    pub fn register(&self, vault: std::sync::Arc<dyn Vault>) {
        let id = vault.id().to_string();
        if self.vaults.insert(id.clone(), vault).is_none() {
            self.order.lock().expect("vault order lock poisoned").push(id);
        }
    }

    /// Resolve a key against a named vault or all vaults in order
    pub fn lookup(&self, vault_id: Option<&str>, key: &str) -> Option<String> {
        match vault_id {
            Some(id) => self.vaults.get(id).and_then(|v| v.lookup(key)),
            None => {
                let order = self.order.lock().expect("vault order lock poisoned").clone();
                order
                    .iter()
                    .filter_map(|id| self.vaults.get(id))
                    .find_map(|v| v.lookup(key))
            }
        }
    }

    /// Expand every variable reference in a string
    pub fn expand_str(&self, text: &str) -> String {
        VAR_REGEX
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let vault_id = caps.get(1).map(|m| m.as_str());
                let key = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                match self.lookup(vault_id, key) {
                    Some(value) => value,
                    None => match caps.get(3) {
                        Some(default) => default.as_str().to_string(),
                        None => caps.get(0).expect("whole match").as_str().to_string(),
                    },
                }
            })
            .into_owned()
    }

    /// Expand all string values in a dict, recursively
    pub fn expand_dict(&self, dict: &Dict) -> Dict {
        let mut out = Dict::new();
        for (key, value) in dict.iter() {
            out.set(key, self.expand_value(value));
        }
        out
    }

    fn expand_value(&self, value: &Value) -> Value {
        match value {
            Value::Str(s) => Value::Str(self.expand_str(s)),
            Value::Dict(d) => Value::Dict(self.expand_dict(d)),
            Value::Array(a) => Value::Array(a.iter().map(|v| self.expand_value(v)).collect()),
            other => other.clone(),
        }
    }
}

impl Default for VaultRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VaultRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.vaults.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("VaultRegistry").field("vaults", &ids).finish()
    }
}
