//! Root storage: mount table + object cache
//!
//! The root storage composes other storages at *mount points*. Each mount
//! is registered under a unique storage path (`/storage/plugin/<id>/`) and
//! may additionally be *overlaid* at a second path (usually `/`), which is
//! how plug-ins contribute objects to the shared tree. Reads consult
//! candidate mounts in descending priority then mount order; writes go to
//! the first writable mount covering the target.
//!
//! In front of the mount table sits the object cache: the only place that
//! constructs [`StorableObject`] instances and calls their `init()`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, warn};

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::path::StoragePath;
use crate::types::TypeRegistry;

use super::{InitContext, Metadata, StorableObject, Storage};

/// One mount registration
#[derive(Debug, Clone)]
struct Mount {
    storage_path: StoragePath,
    storage: Arc<dyn Storage>,
    read_only: bool,
    overlay_path: Option<StoragePath>,
    priority: i32,
    order: u64,
}

impl Mount {
    /// Backing path for `path` seen through the overlay, if covered
    fn overlay_backing(&self, path: &StoragePath) -> Option<StoragePath> {
        let overlay = self.overlay_path.as_ref()?;
        path.strip_prefix(overlay)
    }

    /// Backing path for `path` under the mount's own storage path
    fn direct_backing(&self, path: &StoragePath) -> Option<StoragePath> {
        path.strip_prefix(&self.storage_path)
    }
}

/// Externally visible mount description
#[derive(Debug, Clone, PartialEq)]
pub struct MountInfo {
    pub storage_path: StoragePath,
    pub read_only: bool,
    pub overlay_path: Option<StoragePath>,
    pub priority: i32,
}

/// The composing storage at the center of the kernel
pub struct RootStorage {
    mounts: RwLock<Vec<Mount>>,
    cache: DashMap<StoragePath, Arc<dyn StorableObject>>,
    registry: Arc<TypeRegistry>,
    init_cx: InitContext,
    next_order: AtomicU64,
}

impl RootStorage {
    pub fn new(registry: Arc<TypeRegistry>, init_cx: InitContext) -> Self {
        Self {
            mounts: RwLock::new(Vec::new()),
            cache: DashMap::new(),
            registry,
            init_cx,
            next_order: AtomicU64::new(0),
        }
    }

    pub fn init_context(&self) -> &InitContext {
        &self.init_cx
    }

    pub fn type_registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    // Mount table operations. All three writers take the table lock once
    // and leave no intermediate state visible.

    /// Register a storage at a unique mount point
    ///
    /// New mounts start read-only with no overlay and priority 0; use
    /// [`remount`](Self::remount) to change visibility.
    pub fn mount(&self, storage: Arc<dyn Storage>, storage_path: StoragePath) -> Result<()> {
        if !storage_path.is_index() {
            return Err(Error::BadRequest(format!(
                "mount point must be an index path: {}",
                storage_path
            )));
        }
        let mut mounts = self.mounts.write().expect("mount table lock poisoned");
        if mounts.iter().any(|m| m.storage_path == storage_path) {
            return Err(Error::BadRequest(format!(
                "mount point already in use: {}",
                storage_path
            )));
        }
        debug!(path = %storage_path, "mounting storage");
        mounts.push(Mount {
            storage_path,
            storage,
            read_only: true,
            overlay_path: None,
            priority: 0,
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
        });
        Ok(())
    }

    /// Change visibility of an existing mount
    pub fn remount(
        &self,
        storage_path: &StoragePath,
        read_only: bool,
        overlay_path: Option<StoragePath>,
        priority: i32,
    ) -> Result<()> {
        let mut mounts = self.mounts.write().expect("mount table lock poisoned");
        let mount = mounts
            .iter_mut()
            .find(|m| &m.storage_path == storage_path)
            .ok_or_else(|| Error::BadRequest(format!("no mount at {}", storage_path)))?;
        mount.read_only = read_only;
        mount.overlay_path = overlay_path;
        mount.priority = priority;
        Ok(())
    }

    /// Remove a mount, dropping its backing storage
    pub fn unmount(&self, storage_path: &StoragePath) -> Result<()> {
        let removed = {
            let mut mounts = self.mounts.write().expect("mount table lock poisoned");
            let pos = mounts
                .iter()
                .position(|m| &m.storage_path == storage_path)
                .ok_or_else(|| Error::BadRequest(format!("no mount at {}", storage_path)))?;
            mounts.remove(pos)
        };
        debug!(path = %removed.storage_path, "unmounted storage");
        Ok(())
    }

    /// Current mounts in visibility order
    pub fn mount_info(&self) -> Vec<MountInfo> {
        self.snapshot()
            .iter()
            .map(|m| MountInfo {
                storage_path: m.storage_path.clone(),
                read_only: m.read_only,
                overlay_path: m.overlay_path.clone(),
                priority: m.priority,
            })
            .collect()
    }

    /// Snapshot of the mount table in visibility order
    ///
    /// Readers work from this snapshot for the whole operation, so a
    /// concurrent remount never tears a single load.
    fn snapshot(&self) -> Vec<Mount> {
        let mut mounts = self.mounts.read().expect("mount table lock poisoned").clone();
        mounts.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
        mounts
    }

    // Raw dictionary access (no object construction)

    /// Load the raw dictionary at `path`, first visible candidate wins
    pub async fn load_dict(&self, path: &StoragePath) -> Result<Option<Dict>> {
        if path.is_index() {
            return Ok(None);
        }
        for mount in self.snapshot() {
            for backing in [mount.overlay_backing(path), mount.direct_backing(path)]
                .into_iter()
                .flatten()
            {
                match mount.storage.load(&backing).await {
                    Ok(Some(dict)) => return Ok(Some(dict)),
                    Ok(None) => {}
                    Err(Error::BadObject { path, reason }) => {
                        warn!(%path, %reason, "skipping unreadable object");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }

    /// Store a dictionary, selecting the first writable covering mount
    pub async fn store(&self, path: &StoragePath, data: Dict) -> Result<()> {
        let target = self
            .snapshot()
            .into_iter()
            .find_map(|mount| {
                if mount.read_only {
                    return None;
                }
                mount
                    .overlay_backing(path)
                    .or_else(|| mount.direct_backing(path))
                    .map(|backing| (mount, backing))
            });
        let Some((mount, backing)) = target else {
            return Err(Error::ReadOnly(path.to_string()));
        };
        mount.storage.store(&backing, data).await?;
        // drop any cached instance so the next load sees the new data
        self.cache.remove(path);
        Ok(())
    }

    /// Remove an object from the first writable covering mount
    pub async fn remove(&self, path: &StoragePath) -> Result<()> {
        let target = self
            .snapshot()
            .into_iter()
            .find_map(|mount| {
                if mount.read_only {
                    return None;
                }
                mount
                    .overlay_backing(path)
                    .or_else(|| mount.direct_backing(path))
                    .map(|backing| (mount, backing))
            });
        let Some((mount, backing)) = target else {
            return Err(Error::ReadOnly(path.to_string()));
        };
        mount.storage.remove(&backing).await?;
        if let Some((_, obj)) = self.cache.remove(path) {
            obj.destroy();
        }
        Ok(())
    }

    // Object cache

    /// Load the typed object at `path`, constructing and caching on miss
    ///
    /// Construction failures are logged and reported as a miss; the raw
    /// dictionary stays reachable through [`load_dict`](Self::load_dict).
    pub async fn load(&self, path: &StoragePath) -> Result<Option<Arc<dyn StorableObject>>> {
        if let Some(obj) = self.cache.get(path) {
            obj.core().activate();
            return Ok(Some(obj.clone()));
        }
        let Some(dict) = self.load_dict(path).await? else {
            return Ok(None);
        };
        let obj = match self.registry.construct(self, path, dict).await {
            Ok(obj) => obj,
            Err(e) => {
                warn!(%path, error = %e, "object construction failed");
                return Ok(None);
            }
        };
        if let Err(e) = obj.init(&self.init_cx) {
            warn!(%path, error = %e, "object init failed");
            return Ok(None);
        }
        // connections manage their own (shorter) activity window
        if !obj.core().object_type().starts_with("connection") {
            obj.core()
                .set_active_window(self.init_cx.limits.object_active_secs * 1000);
        }
        obj.core().activate();
        // a concurrent load may have won the race; keep the first instance
        let entry = self
            .cache
            .entry(path.clone())
            .or_insert_with(|| obj.clone());
        Ok(Some(entry.clone()))
    }

    /// Number of currently cached objects
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Evict inactive cache entries, writing back modified ones
    ///
    /// With `force`, every entry is flushed and dropped regardless of
    /// activity (used on reset/shutdown). Connection objects additionally
    /// get `passivate()` every tick to drive idle-channel eviction.
    pub async fn cache_clean(&self, force: bool) {
        let paths: Vec<StoragePath> = self.cache.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            let Some(obj) = self.cache.get(&path).map(|e| e.value().clone()) else {
                continue;
            };
            if force || !obj.is_active() {
                if obj.core().is_modified() {
                    if let Err(e) = self.store_raw(&path, obj.serialize()).await {
                        warn!(%path, error = %e, "write-back failed, keeping object cached");
                        continue;
                    }
                }
                obj.passivate();
                obj.destroy();
                self.cache.remove(&path);
            } else if obj.core().object_type().starts_with("connection") {
                obj.passivate();
            }
        }
    }

    /// Invalidate all cached objects under a path prefix
    ///
    /// Modified entries are written back first. Used when mounts change
    /// underneath cached paths (plug-in load/unload).
    pub async fn cache_remove(&self, prefix: &StoragePath) {
        let paths: Vec<StoragePath> = self
            .cache
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| p.starts_with(prefix))
            .collect();
        for path in paths {
            if let Some((_, obj)) = self.cache.remove(&path) {
                if obj.core().is_modified() {
                    if let Err(e) = self.store_raw(&path, obj.serialize()).await {
                        warn!(%path, error = %e, "write-back on invalidation failed");
                    }
                }
                obj.destroy();
            }
        }
    }

    /// Store without touching the cache (write-back path)
    async fn store_raw(&self, path: &StoragePath, data: Dict) -> Result<()> {
        let target = self
            .snapshot()
            .into_iter()
            .find_map(|mount| {
                if mount.read_only {
                    return None;
                }
                mount
                    .overlay_backing(path)
                    .or_else(|| mount.direct_backing(path))
                    .map(|backing| (mount, backing))
            });
        let Some((mount, backing)) = target else {
            return Err(Error::ReadOnly(path.to_string()));
        };
        mount.storage.store(&backing, data).await
    }

    // Query

    /// Stream metadata under `prefix` across all visible mounts
    ///
    /// Entries are deduplicated by effective path with higher-priority
    /// mounts winning. Hidden top-level trees (leading `.` segment, e.g.
    /// `/.metrics/`) are omitted unless the prefix asks for them.
    pub fn query<'a>(&'a self, prefix: &StoragePath) -> BoxStream<'a, Metadata> {
        let prefix = prefix.clone();
        stream::once(async move { stream::iter(self.collect_query(&prefix).await) })
            .flatten()
            .boxed()
    }

    async fn collect_query(&self, prefix: &StoragePath) -> Vec<Metadata> {
        let include_hidden = prefix.segments().iter().any(|s| s.starts_with('.'));
        let mut seen: HashSet<StoragePath> = HashSet::new();
        let mut found = Vec::new();
        for mount in self.snapshot() {
            let mut views: Vec<(StoragePath, StoragePath)> = Vec::new();
            for base in std::iter::once(&mount.storage_path)
                .chain(mount.overlay_path.iter())
            {
                if let Some(backing) = prefix.strip_prefix(base) {
                    views.push((base.clone(), backing));
                } else if base.starts_with(prefix) {
                    views.push((base.clone(), StoragePath::root()));
                }
            }
            for (base, backing_prefix) in views {
                let mut entries = mount.storage.query(&backing_prefix);
                while let Some(meta) = entries.next().await {
                    let effective = base.join(&meta.path);
                    if !include_hidden && effective.segments().iter().any(|s| s.starts_with('.')) {
                        continue;
                    }
                    if seen.insert(effective.clone()) {
                        found.push(Metadata {
                            path: effective,
                            object_type: meta.object_type,
                            last_modified: meta.last_modified,
                        });
                    }
                }
            }
        }
        found
    }
}

impl std::fmt::Debug for RootStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootStorage")
            .field("mounts", &self.mount_info())
            .field("cached", &self.cache.len())
            .finish()
    }
}
