//! Plug-in manager
//!
//! A plug-in is a gzipped tar bundle whose root is a storage tree plus a
//! `plugin.json` manifest (`{id, version, platform, date, description}`).
//! Installing unpacks the bundle under the local plug-in directory; loading
//! mounts the unpacked tree at `/storage/plugin/<id>/` and overlays it at
//! `/`, making its objects visible in the shared tree. Loading is atomic:
//! on any failure the mount table and `/config` are rolled back and the
//! plug-in is left cleanly unloaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use futures::StreamExt;
use tar::Archive;
use tracing::{info, warn};

use crate::dict::{Dict, Value};
use crate::error::{Error, Result};
use crate::path::StoragePath;
use crate::storage::archive::{normalize_entry_path, ArchiveStorage};
use crate::storage::dir::DirStorage;
use crate::storage::root::RootStorage;
use crate::storage::Storage;

/// The singleton configuration object path
pub const CONFIG_PATH: &str = "/config";

/// Plug-ins that are part of the installation and cannot be unloaded
const PROTECTED_IDS: &[&str] = &["system", "local"];

/// Manages the plug-in directory and the plug-in mounts
pub struct PluginManager {
    root: Arc<RootStorage>,
    /// Local plug-in directory; installs land here
    plugin_dir: PathBuf,
    /// Read-only plug-ins shipped with the installation
    base_dir: Option<PathBuf>,
}

impl PluginManager {
    pub fn new(root: Arc<RootStorage>, plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            root,
            plugin_dir: plugin_dir.into(),
            base_dir: None,
        }
    }

    /// Also search an installation directory for plug-ins
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Directory holding an installed plug-in, local dir first
    fn find_dir(&self, id: &str) -> Option<PathBuf> {
        let local = self.plugin_dir.join(id);
        if local.is_dir() {
            return Some(local);
        }
        let base = self.base_dir.as_ref()?.join(id);
        base.is_dir().then_some(base)
    }

    /// Ids of all currently loaded plug-ins, in mount order
    pub fn loaded_ids(&self) -> Vec<String> {
        let prefix: StoragePath = "/storage/plugin/".parse().expect("valid prefix");
        self.root
            .mount_info()
            .into_iter()
            .filter_map(|m| {
                m.storage_path
                    .strip_prefix(&prefix)
                    .and_then(|rel| rel.segments().first().cloned())
            })
            .collect()
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.loaded_ids().iter().any(|p| p == id)
    }

    /// Install a plug-in bundle, returning its declared id
    ///
    /// The bundle is validated up front (every object must parse, every
    /// entry path must be safe), unpacked into a staging directory and
    /// only moved into place once fully extracted. Installing over an
    /// existing unloaded plug-in replaces it.
    pub async fn install(&self, bundle: &Path) -> Result<String> {
        let preview = ArchiveStorage::open(bundle)?;
        let manifest_path: StoragePath = "/plugin".parse().expect("valid manifest path");
        let manifest = preview
            .load(&manifest_path)
            .await?
            .ok_or_else(|| Error::Plugin("bundle has no plugin.json manifest".into()))?;
        let id = validate_plugin_id(&manifest)?;
        if self.is_loaded(&id) {
            return Err(Error::Plugin(format!(
                "plug-in {} is loaded; unload before reinstalling",
                id
            )));
        }

        let staging = self.plugin_dir.join(format!(".install-{}", id));
        let _ = std::fs::remove_dir_all(&staging);
        if let Err(e) = unpack_bundle(bundle, &staging) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        // normalize the manifest into the storage tree so the mounted
        // plug-in exposes it at /plugin/<id>
        let normalized = (|| -> Result<()> {
            let plugin_subdir = staging.join("plugin");
            std::fs::create_dir_all(&plugin_subdir)?;
            std::fs::write(plugin_subdir.join(format!("{}.json", id)), manifest.to_json())?;
            let _ = std::fs::remove_file(staging.join("plugin.json"));
            Ok(())
        })();
        if let Err(e) = normalized {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        let target = self.plugin_dir.join(&id);
        let _ = std::fs::remove_dir_all(&target);
        std::fs::rename(&staging, &target)?;
        info!(plugin = %id, "installed plug-in");
        Ok(id)
    }

    /// Load an installed plug-in
    ///
    /// Mounts the plug-in storage, overlays it at `/`, appends the id to
    /// the `/config` plug-in list and invalidates cached objects under the
    /// overlaid trees. Rolls back completely on failure.
    pub async fn load(&self, id: &str) -> Result<()> {
        validate_id_chars(id)?;
        if self.is_loaded(id) {
            return Err(Error::Plugin(format!("plug-in {} is already loaded", id)));
        }
        let storage: Arc<dyn Storage> = if id == "local" {
            Arc::new(DirStorage::open(self.plugin_dir.join(id))?)
        } else {
            let dir = self
                .find_dir(id)
                .ok_or_else(|| Error::Plugin(format!("plug-in {} is not installed", id)))?;
            Arc::new(
                DirStorage::open_read_only(&dir)
                    .map_err(|_| Error::Plugin(format!("plug-in {} is not installed", id)))?,
            )
        };

        let mount_path = storage_mount_path(id);
        let overlaid = top_level_trees(storage.as_ref()).await;

        self.root.mount(storage.clone(), mount_path.clone())?;
        let result = self.activate(id, storage.as_ref(), &mount_path).await;
        if let Err(e) = result {
            // roll back: the mount (and any /config change) must not survive
            let _ = self.root.unmount(&mount_path);
            warn!(plugin = %id, error = %e, "plug-in load rolled back");
            return Err(e);
        }

        for tree in overlaid {
            self.root.cache_remove(&tree).await;
        }
        info!(plugin = %id, "loaded plug-in");
        Ok(())
    }

    async fn activate(&self, id: &str, storage: &dyn Storage, mount_path: &StoragePath) -> Result<()> {
        let manifest_path: StoragePath = format!("/plugin/{}", id)
            .parse()
            .map_err(|_| Error::Plugin(format!("invalid plug-in id: {}", id)))?;
        let manifest = storage
            .load(&manifest_path)
            .await?
            .ok_or_else(|| Error::Plugin(format!("plug-in {} has no manifest", id)))?;
        if manifest.str_or("id", "") != id {
            return Err(Error::Plugin(format!(
                "manifest id {:?} does not match plug-in {}",
                manifest.str_or("id", ""),
                id
            )));
        }

        let priority = manifest.int_or("priority", if id == "system" { 0 } else { 10 }) as i32;
        let writable = id == "local";
        self.root.remount(
            mount_path,
            !writable,
            Some(StoragePath::root()),
            priority,
        )?;

        // the installation plug-ins are always loaded, never listed
        if PROTECTED_IDS.contains(&id) {
            return Ok(());
        }
        self.add_to_config(id).await
    }

    /// Unload a plug-in, reversing everything `load` did
    pub async fn unload(&self, id: &str) -> Result<()> {
        if PROTECTED_IDS.contains(&id) {
            return Err(Error::Plugin(format!("plug-in {} cannot be unloaded", id)));
        }
        if !self.is_loaded(id) {
            return Err(Error::Plugin(format!("plug-in {} is not loaded", id)));
        }
        let mount_path = storage_mount_path(id);
        let overlaid = match self.find_dir(id).and_then(|dir| DirStorage::open_read_only(dir).ok())
        {
            Some(storage) => top_level_trees(&storage).await,
            None => Vec::new(),
        };

        self.root.cache_remove(&mount_path).await;
        self.root.unmount(&mount_path)?;
        for tree in overlaid {
            self.root.cache_remove(&tree).await;
        }
        self.remove_from_config(id).await?;
        info!(plugin = %id, "unloaded plug-in");
        Ok(())
    }

    /// Unload every unprotected plug-in and reload the configured list
    pub async fn reset(&self) -> Result<()> {
        // unloading trims /config, so capture the declared order first
        let configured = self.configured_ids().await?;
        for id in self.loaded_ids() {
            if !PROTECTED_IDS.contains(&id.as_str()) {
                self.unload(&id).await?;
            }
        }
        for id in configured {
            if !self.is_loaded(&id) {
                self.load(&id).await?;
            }
        }
        Ok(())
    }

    /// The plug-in list from the `/config` singleton
    pub async fn configured_ids(&self) -> Result<Vec<String>> {
        let path: StoragePath = CONFIG_PATH.parse().expect("valid config path");
        let config = self.root.load_dict(&path).await?.unwrap_or_default();
        Ok(config
            .str_array("plugins")
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    async fn add_to_config(&self, id: &str) -> Result<()> {
        let path: StoragePath = CONFIG_PATH.parse().expect("valid config path");
        let mut config = self.root.load_dict(&path).await?.unwrap_or_default();
        let mut plugins: Vec<Value> = config
            .array("plugins")
            .map(<[Value]>::to_vec)
            .unwrap_or_default();
        if !plugins.iter().any(|v| v.as_str() == Some(id)) {
            plugins.push(Value::from(id));
            config.set("plugins", plugins);
            self.root.store(&path, config).await?;
        }
        Ok(())
    }

    async fn remove_from_config(&self, id: &str) -> Result<()> {
        let path: StoragePath = CONFIG_PATH.parse().expect("valid config path");
        let Some(mut config) = self.root.load_dict(&path).await? else {
            return Ok(());
        };
        let plugins: Vec<Value> = config
            .array("plugins")
            .map(<[Value]>::to_vec)
            .unwrap_or_default();
        let filtered: Vec<Value> = plugins
            .into_iter()
            .filter(|v| v.as_str() != Some(id))
            .collect();
        config.set("plugins", filtered);
        self.root.store(&path, config).await
    }
}

fn storage_mount_path(id: &str) -> StoragePath {
    format!("/storage/plugin/{}/", id)
        .parse()
        .unwrap_or_else(|_| StoragePath::root())
}

/// Top-level index trees a plug-in storage contributes (for cache clears)
async fn top_level_trees(storage: &dyn Storage) -> Vec<StoragePath> {
    let mut trees: Vec<StoragePath> = Vec::new();
    let mut entries = storage.query(&StoragePath::root());
    while let Some(meta) = entries.next().await {
        if let Some(first) = meta.path.segments().first() {
            let tree = StoragePath::index([first.clone()]);
            if !trees.contains(&tree) {
                trees.push(tree);
            }
        }
    }
    trees
}

fn validate_plugin_id(manifest: &Dict) -> Result<String> {
    let id = manifest.str_or("id", "").to_string();
    validate_id_chars(&id)?;
    Ok(id)
}

fn validate_id_chars(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Plugin(format!("invalid plug-in id: {:?}", id)))
    }
}

/// Unpack a bundle into a directory, rejecting unsafe entry paths
fn unpack_bundle(bundle: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let raw = std::fs::File::open(bundle)?;
    let mut archive = Archive::new(GzDecoder::new(std::io::BufReader::new(raw)));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let entry_path = entry
            .path()
            .map_err(|e| Error::Plugin(format!("unreadable bundle entry: {}", e)))?;
        let Some(rel) = normalize_entry_path(&entry_path) else {
            return Err(Error::Plugin(format!(
                "unsafe bundle entry path: {}",
                entry_path.display()
            )));
        };
        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::storage::mem::MemStorage;
    use crate::storage::InitContext;
    use crate::types::TypeRegistry;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn path(s: &str) -> StoragePath {
        s.parse().unwrap()
    }

    fn write_bundle(file: &Path, entries: &[(&str, &str)]) {
        let raw = std::fs::File::create(file).unwrap();
        let gz = GzEncoder::new(raw, Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn setup(plugin_dir: &Path) -> (Arc<RootStorage>, PluginManager) {
        let root = Arc::new(RootStorage::new(
            Arc::new(TypeRegistry::with_builtins()),
            InitContext::new(LimitsConfig::default()),
        ));
        // a writable base mount holding /config
        let base = Arc::new(MemStorage::new());
        root.mount(base, path("/storage/base/")).unwrap();
        root.remount(&path("/storage/base/"), false, Some(path("/")), -10)
            .unwrap();
        let manager = PluginManager::new(root.clone(), plugin_dir);
        (root, manager)
    }

    fn sample_bundle(dir: &Path) -> PathBuf {
        let bundle = dir.join("sample.plugin");
        write_bundle(
            &bundle,
            &[
                (
                    "plugin.json",
                    r#"{"id": "sample", "type": "plugin", "version": "1.0"}"#,
                ),
                (
                    "webservice/example.json",
                    r#"{"id": "example", "type": "webservice/status", "match": [{"path": "/ex/", "method": "GET"}]}"#,
                ),
            ],
        );
        bundle
    }

    #[tokio::test]
    async fn test_install_load_unload_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let (root, manager) = setup(&tmp.path().join("plugin"));
        let bundle = sample_bundle(tmp.path());

        let id = manager.install(&bundle).await.unwrap();
        assert_eq!(id, "sample");
        assert!(!manager.is_loaded("sample"));

        manager.load("sample").await.unwrap();
        assert!(manager.is_loaded("sample"));
        assert_eq!(manager.configured_ids().await.unwrap(), vec!["sample"]);

        // objects visible through the overlay and the storage path
        assert!(root
            .load_dict(&path("/webservice/example"))
            .await
            .unwrap()
            .is_some());
        assert!(root
            .load_dict(&path("/storage/plugin/sample/webservice/example"))
            .await
            .unwrap()
            .is_some());
        let manifest = root.load_dict(&path("/plugin/sample")).await.unwrap().unwrap();
        assert_eq!(manifest.str_or("version", ""), "1.0");

        manager.unload("sample").await.unwrap();
        assert!(!manager.is_loaded("sample"));
        assert!(manager.configured_ids().await.unwrap().is_empty());
        assert!(root
            .load_dict(&path("/webservice/example"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_load_missing_plugin_leaves_state_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let (root, manager) = setup(&tmp.path().join("plugin"));
        let mounts_before = root.mount_info();

        assert!(manager.load("ghost").await.is_err());
        assert_eq!(root.mount_info(), mounts_before);
        assert!(manager.configured_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_without_manifest_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let plugin_dir = tmp.path().join("plugin");
        let (root, manager) = setup(&plugin_dir);
        // a plug-in directory with no manifest object
        std::fs::create_dir_all(plugin_dir.join("broken/role")).unwrap();
        std::fs::write(
            plugin_dir.join("broken/role/r.json"),
            r#"{"id": "r", "type": "role"}"#,
        )
        .unwrap();

        let mounts_before = root.mount_info();
        assert!(manager.load("broken").await.is_err());
        assert_eq!(root.mount_info(), mounts_before);
        assert!(manager.configured_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_rejects_bad_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let (_root, manager) = setup(&tmp.path().join("plugin"));
        let bundle = tmp.path().join("evil.plugin");
        write_bundle(&bundle, &[("plugin.json", r#"{"id": "../evil"}"#)]);
        assert!(manager.install(&bundle).await.is_err());
    }

    #[tokio::test]
    async fn test_unload_protected_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (_root, manager) = setup(&tmp.path().join("plugin"));
        assert!(manager.unload("system").await.is_err());
        assert!(manager.unload("local").await.is_err());
    }

    #[tokio::test]
    async fn test_reset_reloads_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let (_root, manager) = setup(&tmp.path().join("plugin"));
        let bundle = sample_bundle(tmp.path());
        manager.install(&bundle).await.unwrap();
        manager.load("sample").await.unwrap();

        manager.reset().await.unwrap();
        assert!(manager.is_loaded("sample"));
        assert_eq!(manager.configured_ids().await.unwrap(), vec!["sample"]);
    }
}
