//! Layered object storage
//!
//! A [`Storage`] holds dictionaries addressed by [`StoragePath`]. Concrete
//! variants: in-memory ([`mem::MemStorage`]), file-tree
//! ([`dir::DirStorage`]), read-only bundle ([`archive::ArchiveStorage`]) and
//! the composing [`root::RootStorage`] that stacks other storages at mount
//! points and fronts them with an object cache.

pub mod archive;
pub mod dir;
pub mod mem;
pub mod root;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::config::LimitsConfig;
use crate::connection::DriverRegistry;
use crate::dict::Dict;
use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::path::StoragePath;
use crate::vault::VaultRegistry;

/// Descriptor for an object found by a storage query
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// Effective path of the object
    pub path: StoragePath,
    /// Declared object type (empty when unknown)
    pub object_type: String,
    /// Last modification time, if the backing storage tracks one
    pub last_modified: Option<DateTime<Utc>>,
}

impl Metadata {
    pub fn new(path: StoragePath, object_type: impl Into<String>) -> Self {
        Self {
            path,
            object_type: object_type.into(),
            last_modified: None,
        }
    }

    pub fn with_modified(mut self, time: DateTime<Utc>) -> Self {
        self.last_modified = Some(time);
        self
    }
}

/// A path-addressed dictionary store
///
/// `load` returns `Ok(None)` on a miss; only genuine failures (I/O,
/// corrupt data) surface as errors. `store` replaces the whole object
/// atomically where the backing medium supports it.
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// True if this storage rejects `store` and `remove`
    fn is_read_only(&self) -> bool;

    /// Stream metadata for all objects under a path prefix
    ///
    /// Consumers may drop the stream early; implementations must not
    /// require it to be drained.
    fn query<'a>(&'a self, prefix: &StoragePath) -> BoxStream<'a, Metadata>;

    /// Load the object stored at `path`
    async fn load(&self, path: &StoragePath) -> Result<Option<Dict>>;

    /// Store an object at `path`, replacing any previous one
    async fn store(&self, path: &StoragePath, data: Dict) -> Result<()>;

    /// Remove the object at `path` (missing objects are not an error)
    async fn remove(&self, path: &StoragePath) -> Result<()>;
}

/// Context handed to [`StorableObject::init`]
///
/// Carries the process-wide collaborators an object may need when it comes
/// alive: sizing defaults, the connection driver registry and the metrics
/// sink.
#[derive(Clone)]
pub struct InitContext {
    pub limits: LimitsConfig,
    pub drivers: Arc<DriverRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    pub vaults: Arc<VaultRegistry>,
}

impl InitContext {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            drivers: Arc::new(DriverRegistry::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            vaults: Arc::new(VaultRegistry::new()),
        }
    }

    pub fn with_drivers(mut self, drivers: Arc<DriverRegistry>) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_vaults(mut self, vaults: Arc<VaultRegistry>) -> Self {
        self.vaults = vaults;
        self
    }
}

/// A typed in-memory instance of a stored dictionary
///
/// Instances are constructed only by the root storage's object cache, via
/// the type registry. The lifecycle is: construct, `init()`, any number of
/// `activate()` stamps on access, then on eviction `passivate()` (after
/// write-back when modified) and finally `destroy()`.
pub trait StorableObject: Send + Sync {
    /// The shared lifecycle state embedded in every object
    fn core(&self) -> &ObjectCore;

    /// Downcasting hook for kernel components
    fn as_any(&self) -> &dyn Any;

    /// Owned downcasting hook; implementations return `self`
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Called once after construction, before the object is visible
    fn init(&self, _cx: &InitContext) -> Result<()> {
        Ok(())
    }

    /// Called when the object leaves the cache for good
    fn destroy(&self) {}

    /// Clear transient state ahead of eviction
    ///
    /// The default clears the modified flag; connections additionally
    /// evict idle channels here (the cache-clean tick calls this on every
    /// connection, active or not).
    fn passivate(&self) {
        self.core().clear_modified();
    }

    /// True while the object must not be evicted
    fn is_active(&self) -> bool {
        self.core().is_active()
    }

    /// Snapshot of the object's dictionary for persistence
    fn serialize(&self) -> Dict {
        self.core().dict()
    }
}

impl dyn StorableObject {
    /// Typed downcast of a cached object
    pub fn downcast<T: 'static>(self: &Arc<Self>) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Typed owned downcast of a cached object
    pub fn downcast_arc<T: Send + Sync + 'static>(self: Arc<Self>) -> Option<Arc<T>> {
        self.as_any_arc().downcast::<T>().ok()
    }
}

/// Lifecycle state shared by all storable objects
///
/// Tracks the backing dictionary plus the `(activated_time, modified)`
/// pair driving cache eviction.
pub struct ObjectCore {
    id: String,
    object_type: String,
    dict: RwLock<Dict>,
    activated: AtomicI64,
    modified: AtomicBool,
    active_window_ms: AtomicI64,
}

impl ObjectCore {
    /// Create lifecycle state with the default active window (300 s)
    pub fn new(id: impl Into<String>, object_type: impl Into<String>, dict: Dict) -> Self {
        Self::with_window(id, object_type, dict, 300_000)
    }

    /// Create lifecycle state with an explicit active window in millis
    pub fn with_window(
        id: impl Into<String>,
        object_type: impl Into<String>,
        dict: Dict,
        active_window_ms: i64,
    ) -> Self {
        Self {
            id: id.into(),
            object_type: object_type.into(),
            dict: RwLock::new(dict),
            activated: AtomicI64::new(Utc::now().timestamp_millis()),
            modified: AtomicBool::new(false),
            active_window_ms: AtomicI64::new(active_window_ms),
        }
    }

    /// Adjust the active window (applied from configuration at load)
    pub fn set_active_window(&self, window_ms: i64) {
        self.active_window_ms.store(window_ms, Ordering::Release);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    /// Clone of the current dictionary
    pub fn dict(&self) -> Dict {
        self.dict.read().expect("dict lock poisoned").clone()
    }

    /// Read access to the dictionary
    pub fn with_dict<R>(&self, f: impl FnOnce(&Dict) -> R) -> R {
        f(&self.dict.read().expect("dict lock poisoned"))
    }

    /// Mutate the dictionary, marking the object modified
    pub fn update(&self, f: impl FnOnce(&mut Dict)) {
        let mut dict = self.dict.write().expect("dict lock poisoned");
        f(&mut dict);
        self.modified.store(true, Ordering::Release);
    }

    /// Stamp the access time, extending the active window
    pub fn activate(&self) {
        self.activated
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Millis since the last activation
    pub fn idle_millis(&self) -> i64 {
        Utc::now().timestamp_millis() - self.activated.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.idle_millis() <= self.active_window_ms.load(Ordering::Acquire)
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    pub fn mark_modified(&self) {
        self.modified.store(true, Ordering::Release);
    }

    pub fn clear_modified(&self) {
        self.modified.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ObjectCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCore")
            .field("id", &self.id)
            .field("type", &self.object_type)
            .field("modified", &self.is_modified())
            .finish()
    }
}

/// Fallback object for types without a local constructor
///
/// Covers raw dicts, `remote` types and the bootstrapped `type` records
/// themselves.
#[derive(Debug)]
pub struct GenericObject {
    core: ObjectCore,
}

impl GenericObject {
    pub fn new(id: &str, object_type: &str, dict: Dict) -> Arc<dyn StorableObject> {
        Arc::new(Self {
            core: ObjectCore::new(id, object_type, dict),
        })
    }
}

impl StorableObject for GenericObject {
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
