//! Read-only bundle storage
//!
//! Plug-in bundles are gzipped tar archives whose root is a storage tree.
//! The whole tree of JSON objects is materialized into memory when the
//! bundle is opened; bundles are small and the mount table expects
//! synchronous reads after load.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Component, Path};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures::stream::{self, BoxStream, StreamExt};
use tar::Archive;

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::path::StoragePath;

use super::{Metadata, Storage};

/// Largest accepted size for a single bundle entry
const MAX_ENTRY_BYTES: u64 = 16 * 1024 * 1024;

/// Storage over the contents of a `.tgz` bundle
#[derive(Debug)]
pub struct ArchiveStorage {
    entries: BTreeMap<StoragePath, Dict>,
}

impl ArchiveStorage {
    /// Open a bundle file and materialize its object tree
    ///
    /// Only `*.json` entries become objects; other entries (code and file
    /// resources for external handlers) are ignored here. Entry paths are
    /// normalized and anything escaping the bundle root is rejected.
    pub fn open(file: &Path) -> Result<Self> {
        let raw = std::fs::File::open(file)?;
        let mut archive = Archive::new(GzDecoder::new(std::io::BufReader::new(raw)));
        let mut entries = BTreeMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            if entry.size() > MAX_ENTRY_BYTES {
                return Err(Error::Plugin(format!(
                    "bundle entry too large: {} bytes",
                    entry.size()
                )));
            }
            let entry_path = entry.path().map_err(|e| {
                Error::Plugin(format!("unreadable bundle entry path: {}", e))
            })?;
            let Some(rel) = normalize_entry_path(&entry_path) else {
                return Err(Error::Plugin(format!(
                    "unsafe bundle entry path: {}",
                    entry_path.display()
                )));
            };
            let Some(stem) = rel.strip_suffix(".json") else {
                continue;
            };
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            let path: StoragePath = format!("/{}", stem).parse().map_err(|_| {
                Error::Plugin(format!("invalid bundle object path: {}", rel))
            })?;
            let dict = Dict::from_json(&text)
                .map_err(|e| Error::bad_object(&path, format!("invalid JSON: {}", e)))?;
            entries.insert(path, dict);
        }
        Ok(Self { entries })
    }

    /// Build directly from objects (test fixtures)
    #[cfg(test)]
    pub fn from_entries(items: impl IntoIterator<Item = (StoragePath, Dict)>) -> Self {
        Self {
            entries: items.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalize a tar entry path to a safe relative slash string
///
/// Returns `None` for absolute paths and any path containing `..`.
pub(crate) fn normalize_entry_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[async_trait]
impl Storage for ArchiveStorage {
    fn is_read_only(&self) -> bool {
        true
    }

    fn query<'a>(&'a self, prefix: &StoragePath) -> BoxStream<'a, Metadata> {
        let prefix = prefix.clone();
        stream::iter(
            self.entries
                .iter()
                .filter(move |(path, _)| path.starts_with(&prefix))
                .map(|(path, dict)| Metadata::new(path.clone(), dict.str_or("type", ""))),
        )
        .boxed()
    }

    async fn load(&self, path: &StoragePath) -> Result<Option<Dict>> {
        Ok(self.entries.get(path).cloned())
    }

    async fn store(&self, path: &StoragePath, _data: Dict) -> Result<()> {
        Err(Error::ReadOnly(path.to_string()))
    }

    async fn remove(&self, path: &StoragePath) -> Result<()> {
        Err(Error::ReadOnly(path.to_string()))
    }
}
