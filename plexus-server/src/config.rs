//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: PLEXUS_)
//! 2. An optional key=value properties file (`--properties` style preload)
//! 3. Current working directory: ./plexus.toml
//! 4. Default values

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Web dispatch configuration
    #[serde(default)]
    pub web: WebConfig,

    /// Kernel timing and sizing limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_name")]
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Web dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Authentication realm presented in digest challenges
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Session cookie name
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Session cookie path
    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,

    /// Session cookie domain (none = host-only)
    #[serde(default)]
    pub cookie_domain: Option<String>,
}

/// Kernel timing and sizing limits
///
/// Defaults match the documented background-job timing constants; override
/// only in tests or unusual deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Object cache clean interval in seconds
    #[serde(default = "default_cache_clean")]
    pub cache_clean_secs: u64,

    /// Expired-session sweep interval in seconds
    #[serde(default = "default_session_sweep")]
    pub session_sweep_secs: u64,

    /// Channel borrow wait limit in milliseconds
    #[serde(default = "default_pool_max_wait")]
    pub pool_max_wait_ms: u64,

    /// Anonymous session lifetime in seconds
    #[serde(default = "default_session_ttl_anon")]
    pub session_ttl_anon_secs: i64,

    /// Authenticated session lifetime in seconds
    #[serde(default = "default_session_ttl_auth")]
    pub session_ttl_auth_secs: i64,

    /// Maximum nonce age in minutes
    #[serde(default = "default_token_stale")]
    pub token_stale_minutes: i64,

    /// Default maximum open channels per connection
    #[serde(default = "default_channel_max_open")]
    pub channel_max_open: i64,

    /// Default idle channel lifetime in seconds
    #[serde(default = "default_channel_max_idle")]
    pub channel_max_idle_secs: i64,

    /// Default object cache active window in seconds
    #[serde(default = "default_object_active")]
    pub object_active_secs: i64,

    /// Maximum procedure call stack depth
    #[serde(default = "default_call_stack")]
    pub max_call_depth: usize,
}

fn default_name() -> String {
    "plexus".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_realm() -> String {
    "Plexus".to_string()
}
fn default_cookie_name() -> String {
    "sessionid".to_string()
}
fn default_cookie_path() -> String {
    "/".to_string()
}
fn default_cache_clean() -> u64 {
    30
}
fn default_session_sweep() -> u64 {
    3600
}
fn default_pool_max_wait() -> u64 {
    5000
}
fn default_session_ttl_anon() -> i64 {
    30 * 60
}
fn default_session_ttl_auth() -> i64 {
    30 * 24 * 60 * 60
}
fn default_token_stale() -> i64 {
    240
}
fn default_channel_max_open() -> i64 {
    4
}
fn default_channel_max_idle() -> i64 {
    600
}
fn default_object_active() -> i64 {
    300
}
fn default_call_stack() -> usize {
    64
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            port: default_port(),
            log_level: default_log_level(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            realm: default_realm(),
            cookie_name: default_cookie_name(),
            cookie_path: default_cookie_path(),
            cookie_domain: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cache_clean_secs: default_cache_clean(),
            session_sweep_secs: default_session_sweep(),
            pool_max_wait_ms: default_pool_max_wait(),
            session_ttl_anon_secs: default_session_ttl_anon(),
            session_ttl_auth_secs: default_session_ttl_auth(),
            token_stale_minutes: default_token_stale(),
            channel_max_open: default_channel_max_open(),
            channel_max_idle_secs: default_channel_max_idle(),
            object_active_secs: default_object_active(),
            max_call_depth: default_call_stack(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            web: WebConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from all default sources
    pub fn load() -> Result<Self> {
        Self::figment(None).extract().map_err(Into::into)
    }

    /// Load configuration with an additional key=value properties file
    ///
    /// Dotted keys nest: `service.port=9090` sets `config.service.port`.
    pub fn load_with_properties(path: &Path) -> Result<Self> {
        let props = read_properties(path)?;
        Self::figment(Some(props)).extract().map_err(Into::into)
    }

    fn figment(properties: Option<serde_json::Value>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("plexus.toml"));
        if let Some(props) = properties {
            figment = figment.merge(Serialized::defaults(props));
        }
        figment.merge(Env::prefixed("PLEXUS_").split("_"))
    }

    /// Pool borrow wait limit as a `Duration`
    pub fn pool_max_wait(&self) -> Duration {
        Duration::from_millis(self.limits.pool_max_wait_ms)
    }
}

/// Parse a `key=value` properties file into a nested JSON tree
///
/// Blank lines and `#` comments are skipped. Dots in keys create nesting.
fn read_properties(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)?;
    let mut root = serde_json::Map::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let mut node = &mut root;
        let parts: Vec<&str> = key.trim().split('.').collect();
        for part in &parts[..parts.len() - 1] {
            node = node
                .entry(part.to_string())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .ok_or_else(|| {
                    crate::error::Error::Internal(format!("property key conflict at {}", part))
                })?;
        }
        node.insert(parts[parts.len() - 1].to_string(), parse_property(value.trim()));
    }
    Ok(serde_json::Value::Object(root))
}

/// Interpret a property value as bool, integer, float or string
fn parse_property(raw: &str) -> serde_json::Value {
    if raw == "true" {
        return serde_json::Value::Bool(true);
    }
    if raw == "false" {
        return serde_json::Value::Bool(false);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return serde_json::Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(raw.to_string())
}
