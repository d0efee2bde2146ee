//! Role records and compiled access rules
//!
//! A role's `access[]` list holds ordered rules of
//! `{path | regex, via?, permission}`. Path patterns are globs (`*` one
//! segment, `**` any suffix); `regex` rules are used verbatim. Patterns
//! are compiled once at init and cached on the object, never in the
//! persisted dict.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::dict::Dict;
use crate::error::Result;
use crate::storage::{InitContext, ObjectCore, StorableObject};

/// Access permissions, least to most powerful
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    None,
    Read,
    Search,
    Write,
    All,
}

impl Permission {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "none" => Some(Self::None),
            "read" => Some(Self::Read),
            "search" => Some(Self::Search),
            "write" => Some(Self::Write),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// Automatic role attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Auto {
    /// Only attached by explicit user reference
    #[default]
    None,
    /// Attached to every request, anonymous included
    All,
    /// Attached to any authenticated user
    Auth,
}

#[derive(Debug)]
struct CompiledRule {
    pattern: Regex,
    via: Option<Regex>,
    /// Rule only applies to calls arriving through a procedure
    require_via: bool,
    permissions: Vec<Permission>,
}

/// A storage-backed role with compiled access rules
pub struct Role {
    core: ObjectCore,
    rules: OnceLock<Vec<CompiledRule>>,
}

impl Role {
    /// Constructor registered under the `role` initializer symbol
    pub fn create(id: &str, object_type: &str, dict: Dict) -> Result<Arc<dyn StorableObject>> {
        Ok(Arc::new(Self {
            core: ObjectCore::new(id, object_type, dict),
            rules: OnceLock::new(),
        }))
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn auto(&self) -> Auto {
        self.core.with_dict(|d| match d.str_or("auto", "none") {
            "all" => Auto::All,
            "auth" => Auto::Auth,
            _ => Auto::None,
        })
    }

    fn compiled(&self) -> &[CompiledRule] {
        self.rules.get_or_init(|| {
            self.core.with_dict(|d| compile_rules(d))
        })
    }

    /// Evaluate this role's rules for an access request
    ///
    /// Returns `Some(true)` on the first rule granting the permission,
    /// `Some(false)` on the first matching `none` rule, `None` when no
    /// rule decides. Rules carrying a `via` pattern match against the
    /// caller path when given, otherwise against any id on the call
    /// stack.
    pub fn check_access(
        &self,
        path: &str,
        permission: Permission,
        via: Option<&str>,
        call_stack: &[String],
    ) -> Option<bool> {
        let path = path.trim_start_matches('/');
        for rule in self.compiled() {
            if !rule.pattern.is_match(path) {
                continue;
            }
            if let Some(via_pattern) = &rule.via {
                let via_matches = match via {
                    Some(caller) => via_pattern.is_match(caller.trim_start_matches('/')),
                    None => call_stack
                        .iter()
                        .any(|id| via_pattern.is_match(id.trim_start_matches('/'))),
                };
                if !via_matches {
                    continue;
                }
            } else if rule.require_via && via.is_none() && call_stack.is_empty() {
                continue;
            }
            if rule.permissions.contains(&Permission::None) {
                return Some(false);
            }
            if rule.permissions.contains(&Permission::All)
                || rule.permissions.contains(&permission)
            {
                return Some(true);
            }
        }
        None
    }
}

fn compile_rules(dict: &Dict) -> Vec<CompiledRule> {
    let mut rules = Vec::new();
    let Some(access) = dict.array("access") else {
        return rules;
    };
    for entry in access {
        let Some(rule) = entry.as_dict() else { continue };
        let pattern = if let Some(regex) = rule.get_str("regex") {
            match Regex::new(&anchor(regex)) {
                Ok(re) => re,
                Err(e) => {
                    tracing::warn!(role = dict.str_or("id", "?"), "invalid access regex: {}", e);
                    continue;
                }
            }
        } else {
            glob_to_regex(rule.str_or("path", ""))
        };
        let via = rule
            .get_str("via")
            .map(|v| glob_to_regex(v.trim_start_matches('/')));

        // the legacy "internal" permission means readable, but only from
        // inside a procedure call
        let raw = rule.str_or("permission", "read");
        let mut require_via = false;
        let mut permissions = Vec::new();
        for part in raw.split(',') {
            match part.trim() {
                "internal" => {
                    require_via = true;
                    permissions.push(Permission::Read);
                }
                other => {
                    if let Some(p) = Permission::parse(other) {
                        permissions.push(p);
                    }
                }
            }
        }
        if permissions.is_empty() {
            permissions.push(Permission::Read);
        }
        rules.push(CompiledRule {
            pattern,
            via,
            require_via,
            permissions,
        });
    }
    rules
}

fn anchor(pattern: &str) -> String {
    format!("^(?:{})$", pattern)
}

/// Compile a path glob: `*` matches one segment, `**` any suffix
fn glob_to_regex(glob: &str) -> Regex {
    let glob = glob.trim_start_matches('/');
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '.' | '+' | '?' | '(' | ')' | '[' | ']' | '^' | '$' | '|' | '\\' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('$');
    Regex::new(&out).unwrap_or_else(|_| Regex::new("^$").expect("empty regex is valid"))
}

impl StorableObject for Role {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn init(&self, _cx: &InitContext) -> Result<()> {
        // compile eagerly so malformed patterns are reported at load
        let _ = self.compiled();
        Ok(())
    }
}

impl std::fmt::Debug for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Role")
            .field("id", &self.core.id())
            .field("auto", &self.auto())
            .finish()
    }
}
