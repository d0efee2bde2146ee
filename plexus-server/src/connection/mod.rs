//! External connections and channels
//!
//! A *connection* is a storage-backed object describing an external system
//! (database, message bus, HTTP endpoint). It owns a bounded pool of
//! *channels*: single communication slots leased for the duration of a
//! procedure call. Concrete connection behavior lives in a
//! [`ConnectionDriver`] registered for the connection's type tag; the
//! kernel only manages pooling, validation and lifecycle.

pub mod pool;

use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::storage::{InitContext, ObjectCore, StorableObject};

pub use pool::{ChannelLease, ChannelPool, PooledChannel};

/// A connection counts as recently used for this long after its last
/// lease activity
const ACTIVE_WINDOW_MS: i64 = 60_000;

/// A single leased communication slot against an external system
#[async_trait]
pub trait Channel: Send + Sync {
    /// Downcast hook so procedure code can reach the concrete channel
    fn as_any(&self) -> &dyn Any;

    /// True if the channel may re-enter the idle queue after release
    fn is_poolable(&self) -> bool {
        true
    }

    /// True if nested reservations within one call may share this channel
    fn is_shared(&self) -> bool {
        true
    }

    /// Liveness probe; invalid channels are destroyed, never pooled
    async fn validate(&self) -> bool;

    /// Called when the channel is leased out
    async fn reserve(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the channel is handed back
    async fn release(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory behavior for a family of connection types
#[async_trait]
pub trait ConnectionDriver: Send + Sync {
    /// Validate channels before lending them out (off by default, the
    /// return-side check catches stale channels without borrow latency)
    fn test_on_borrow(&self) -> bool {
        false
    }

    /// Open a new channel using the connection's expanded configuration
    async fn create_channel(&self, config: &Dict) -> Result<Arc<dyn Channel>>;

    /// Tear down a channel that left the pool
    async fn destroy_channel(&self, channel: Arc<dyn Channel>);
}

/// Maps connection type tags to drivers
///
/// Resolution walks the tag hierarchy: `connection/http/rest` matches a
/// driver registered for the full tag, then `connection/http`, then
/// `connection`.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: DashMap<String, Arc<dyn ConnectionDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, type_tag: impl Into<String>, driver: Arc<dyn ConnectionDriver>) {
        self.drivers.insert(type_tag.into(), driver);
    }

    pub fn resolve(&self, type_tag: &str) -> Option<Arc<dyn ConnectionDriver>> {
        let mut tag = type_tag;
        loop {
            if let Some(driver) = self.drivers.get(tag) {
                return Some(driver.clone());
            }
            match tag.rfind('/') {
                Some(pos) => tag = &tag[..pos],
                None => return None,
            }
        }
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<String> = self.drivers.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("DriverRegistry").field("tags", &tags).finish()
    }
}

/// A storage-backed connection object owning a channel pool
pub struct Connection {
    core: ObjectCore,
    pool: OnceLock<Arc<ChannelPool>>,
}

impl Connection {
    /// Constructor registered under the `connection` initializer symbol
    pub fn create(id: &str, object_type: &str, dict: Dict) -> Result<Arc<dyn StorableObject>> {
        Ok(Arc::new(Self {
            core: ObjectCore::with_window(id, object_type, dict, ACTIVE_WINDOW_MS),
            pool: OnceLock::new(),
        }))
    }

    pub fn pool(&self) -> Option<&Arc<ChannelPool>> {
        self.pool.get()
    }

    /// Lease a channel from this connection's pool
    pub async fn reserve(&self) -> Result<ChannelLease> {
        self.core.activate();
        let pool = self
            .pool
            .get()
            .ok_or_else(|| Error::Channel(format!("connection {} not initialized", self.core.id())))?;
        pool.borrow().await
    }

    /// Subject id used for this connection's metrics
    pub fn metric_subject(&self) -> String {
        format!("connection/{}", self.core.id())
    }
}

impl StorableObject for Connection {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn init(&self, cx: &InitContext) -> Result<()> {
        let dict = self.core.dict();
        let max_open = dict.int_or("maxOpen", cx.limits.channel_max_open);
        if max_open < 1 {
            return Err(Error::bad_object(
                format!("/connection/{}", self.core.id()),
                format!("maxOpen must be >= 1, got {}", max_open),
            ));
        }
        let max_idle = dict.int_or("maxIdleSecs", cx.limits.channel_max_idle_secs);
        if max_idle < 0 {
            return Err(Error::bad_object(
                format!("/connection/{}", self.core.id()),
                format!("maxIdleSecs must be >= 0, got {}", max_idle),
            ));
        }
        let driver = cx.drivers.resolve(self.core.object_type()).ok_or_else(|| {
            Error::Channel(format!(
                "no driver registered for connection type {}",
                self.core.object_type()
            ))
        })?;

        let config = cx.vaults.expand_dict(&dict);
        let pool = ChannelPool::new(
            self.metric_subject(),
            driver,
            config,
            max_open as usize,
            Duration::from_secs(max_idle as u64),
            Duration::from_millis(cx.limits.pool_max_wait_ms),
            cx.metrics.clone(),
        );
        self.pool
            .set(pool)
            .map_err(|_| Error::Internal(format!("connection {} initialized twice", self.core.id())))
    }

    /// A connection stays cache-resident while channels are out or it was
    /// used within the last minute
    fn is_active(&self) -> bool {
        match self.pool.get() {
            Some(pool) => {
                pool.leased_channels() > 0 || pool.idle_millis() <= ACTIVE_WINDOW_MS
            }
            None => self.core.is_active(),
        }
    }

    /// Clears the modified flag and sweeps idle channels past their
    /// lifetime (driven by the cache-clean tick)
    fn passivate(&self) {
        self.core.clear_modified();
        if let Some(pool) = self.pool.get() {
            let pool = pool.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { pool.evict_idle().await });
            }
        }
    }

    fn destroy(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.core.id())
            .field("type", &self.core.object_type())
            .field("pool", &self.pool.get())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Controllable channel used across the kernel's pool tests
    #[derive(Debug, Default)]
    pub struct StubChannel {
        valid: AtomicBool,
        pub commits: AtomicUsize,
        pub rollbacks: AtomicUsize,
        shared: bool,
    }

    impl StubChannel {
        pub fn new() -> Self {
            Self {
                valid: AtomicBool::new(true),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
                shared: true,
            }
        }

        pub fn unshared() -> Self {
            Self {
                shared: false,
                ..Self::new()
            }
        }

        pub fn set_valid(&self, valid: bool) {
            self.valid.store(valid, Ordering::Release);
        }
    }

    #[async_trait]
    impl Channel for StubChannel {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn is_shared(&self) -> bool {
            self.shared
        }

        async fn validate(&self) -> bool {
            self.valid.load(Ordering::Acquire)
        }

        async fn commit(&self) -> Result<()> {
            self.commits.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            self.rollbacks.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    /// Driver producing stub channels and counting lifecycle events
    #[derive(Debug, Default)]
    pub struct StubDriver {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        pub unshared: bool,
    }

    impl StubDriver {
        pub fn created(&self) -> usize {
            self.created.load(Ordering::Acquire)
        }

        pub fn destroyed(&self) -> usize {
            self.destroyed.load(Ordering::Acquire)
        }
    }

    #[async_trait]
    impl ConnectionDriver for StubDriver {
        async fn create_channel(&self, _config: &Dict) -> Result<Arc<dyn Channel>> {
            self.created.fetch_add(1, Ordering::AcqRel);
            Ok(Arc::new(if self.unshared {
                StubChannel::unshared()
            } else {
                StubChannel::new()
            }))
        }

        async fn destroy_channel(&self, _channel: Arc<dyn Channel>) {
            self.destroyed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubDriver;
    use super::*;
    use crate::config::LimitsConfig;

    fn init_cx_with_driver() -> InitContext {
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register("connection", Arc::new(StubDriver::default()));
        InitContext::new(LimitsConfig::default()).with_drivers(drivers)
    }

    fn connection(dict: Dict) -> Arc<dyn StorableObject> {
        Connection::create("db", "connection/custom", dict).unwrap()
    }

    #[tokio::test]
    async fn test_init_builds_pool_with_defaults() {
        let obj = connection(Dict::new());
        obj.init(&init_cx_with_driver()).unwrap();
        let conn = obj.downcast::<Connection>().unwrap();
        let lease = conn.reserve().await.unwrap();
        assert_eq!(conn.pool().unwrap().open_channels(), 1);
        conn.pool().unwrap().give_back(lease).await;
    }

    #[tokio::test]
    async fn test_init_rejects_bad_limits() {
        let mut dict = Dict::new();
        dict.set("maxOpen", 0);
        let obj = connection(dict);
        assert!(matches!(
            obj.init(&init_cx_with_driver()),
            Err(Error::BadObject { .. })
        ));

        let mut dict = Dict::new();
        dict.set("maxIdleSecs", -5);
        let obj = connection(dict);
        assert!(obj.init(&init_cx_with_driver()).is_err());
    }

    #[tokio::test]
    async fn test_init_without_driver_fails() {
        let obj = connection(Dict::new());
        let cx = InitContext::new(LimitsConfig::default());
        assert!(matches!(obj.init(&cx), Err(Error::Channel(_))));
    }

    #[tokio::test]
    async fn test_active_while_leased() {
        let obj = connection(Dict::new());
        obj.init(&init_cx_with_driver()).unwrap();
        let conn = obj.downcast::<Connection>().unwrap();

        let lease = conn.reserve().await.unwrap();
        assert!(obj.is_active());
        conn.pool().unwrap().give_back(lease).await;
        // recently used, still active
        assert!(obj.is_active());
    }

    #[test]
    fn test_driver_registry_prefix_resolution() {
        let registry = DriverRegistry::new();
        registry.register("connection/http", Arc::new(StubDriver::default()));
        assert!(registry.resolve("connection/http/rest").is_some());
        assert!(registry.resolve("connection/http").is_some());
        assert!(registry.resolve("connection/sql").is_none());
        assert!(registry.resolve("connection").is_none());
    }
}
