//! # plexus-server
//!
//! Extensible application server kernel. A long-running process accepts
//! HTTP requests, authenticates callers, routes them through a prioritized
//! matcher table to pluggable web services, and executes named server-side
//! procedures that may lease pooled channels against configured external
//! connections. All mutable state (users, roles, sessions, connections,
//! procedures, web services) lives in a layered object store assembled
//! from stackable plug-in bundles that can be mounted, unmounted and
//! hot-reloaded at runtime.
//!
//! ## Example
//!
//! ```rust,no_run
//! use plexus_server::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration
//!     let config = Config::load()?;
//!
//!     // Initialize tracing
//!     init_tracing(&config)?;
//!
//!     // Build the application context (storage, plug-ins, scheduler)
//!     let context = AppContext::init(config, "/opt/plexus", "./data", true).await?;
//!
//!     // Run server
//!     Server::new(context).serve().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod dict;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod path;
pub mod plugin;
pub mod procedure;
pub mod scheduler;
pub mod security;
pub mod session;
pub mod storage;
pub mod types;
pub mod vault;
pub mod web;

pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, LimitsConfig, ServiceConfig, WebConfig};
    pub use crate::connection::{
        Channel, ChannelLease, ChannelPool, Connection, ConnectionDriver, DriverRegistry,
    };
    pub use crate::context::{AppContext, Kernel};
    pub use crate::dict::{Dict, Value};
    pub use crate::error::{AuthKind, Error, ProcedureKind, Result};
    pub use crate::metrics::MetricsRegistry;
    pub use crate::observability::init_tracing;
    pub use crate::path::StoragePath;
    pub use crate::plugin::PluginManager;
    pub use crate::procedure::{
        Binding, BindingKind, Bindings, CallBindings, CallContext, Interceptor, InterceptorChain,
        Library, Procedure, ProcedureExecutor, StoredProcedure,
    };
    pub use crate::scheduler::Scheduler;
    pub use crate::security::{Auto, Permission, Role, SecurityContext, User};
    pub use crate::server::Server;
    pub use crate::session::Session;
    pub use crate::storage::archive::ArchiveStorage;
    pub use crate::storage::dir::DirStorage;
    pub use crate::storage::mem::MemStorage;
    pub use crate::storage::root::{MountInfo, RootStorage};
    pub use crate::storage::{GenericObject, InitContext, Metadata, ObjectCore, StorableObject, Storage};
    pub use crate::types::{Initializer, TypeRegistry};
    pub use crate::vault::{EnvVault, LocalVault, Vault, VaultRegistry};
    pub use crate::web::{RequestInfo, RequestScope, WebDispatcher, WebMatcher, WebService, WebServiceObject};

    // Re-export the building blocks handlers and drivers lean on
    pub use async_trait::async_trait;
    pub use axum::{
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Json, Response},
        Router,
    };
    pub use chrono::{DateTime, Utc};
    pub use serde::{Deserialize, Serialize};
    pub use tokio;
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, trace, warn};
    pub use uuid::Uuid;
}
