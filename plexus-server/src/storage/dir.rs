//! File-tree storage
//!
//! Objects live as `<path>.json` files under a base directory; index paths
//! map to directories. Writes go to a temporary sibling first and are
//! renamed into place, so a crashed write never leaves a half object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::path::StoragePath;

use super::{Metadata, Storage};

const OBJECT_EXT: &str = ".json";

/// Storage backed by a directory of JSON files
#[derive(Debug)]
pub struct DirStorage {
    base: PathBuf,
    read_only: bool,
}

impl DirStorage {
    /// Open (creating if needed) a writable directory storage
    pub fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            read_only: false,
        })
    }

    /// Open an existing directory storage for reading only
    pub fn open_read_only(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        if !base.is_dir() {
            return Err(Error::StorageIo(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such directory: {}", base.display()),
            )));
        }
        Ok(Self {
            base,
            read_only: true,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    fn file_for(&self, path: &StoragePath) -> PathBuf {
        let mut file = self.base.clone();
        for seg in path.segments() {
            file.push(seg);
        }
        if !path.is_index() {
            file.set_file_name(format!("{}{}", path.name(), OBJECT_EXT));
        }
        file
    }

    /// Walk the tree under `prefix`, collecting object metadata
    fn scan(&self, prefix: &StoragePath) -> Vec<Metadata> {
        let start = if prefix.is_index() {
            self.file_for(prefix)
        } else {
            // an object prefix matches at most the single object file
            let file = self.file_for(prefix);
            return match std::fs::metadata(&file) {
                Ok(meta) if meta.is_file() => vec![entry_metadata(prefix.clone(), &meta)],
                _ => Vec::new(),
            };
        };
        let mut found = Vec::new();
        let mut stack = vec![(start, prefix.clone())];
        while let Some((dir, dir_path)) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                if meta.is_dir() {
                    stack.push((entry.path(), dir_path.child(&name, true)));
                } else if let Some(stem) = name.strip_suffix(OBJECT_EXT) {
                    found.push(entry_metadata(dir_path.child(stem, false), &meta));
                }
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        found
    }
}

fn entry_metadata(path: StoragePath, meta: &std::fs::Metadata) -> Metadata {
    // by convention the leading segment names the object type
    let object_type = path
        .segments()
        .first()
        .cloned()
        .unwrap_or_default();
    let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);
    let mut md = Metadata::new(path, object_type);
    md.last_modified = modified;
    md
}

#[async_trait]
impl Storage for DirStorage {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn query<'a>(&'a self, prefix: &StoragePath) -> BoxStream<'a, Metadata> {
        stream::iter(self.scan(prefix)).boxed()
    }

    async fn load(&self, path: &StoragePath) -> Result<Option<Dict>> {
        if path.is_index() {
            return Ok(None);
        }
        let file = self.file_for(path);
        let text = match tokio::fs::read_to_string(&file).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Dict::from_json(&text)
            .map(Some)
            .map_err(|e| Error::bad_object(path, format!("invalid JSON: {}", e)))
    }

    async fn store(&self, path: &StoragePath, data: Dict) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(path.to_string()));
        }
        if path.is_index() {
            return Err(Error::BadRequest(format!(
                "cannot store at index path: {}",
                path
            )));
        }
        let file = self.file_for(path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = file.with_extension("json.tmp");
        tokio::fs::write(&temp, data.to_json()).await?;
        tokio::fs::rename(&temp, &file).await?;
        Ok(())
    }

    async fn remove(&self, path: &StoragePath) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(path.to_string()));
        }
        let file = self.file_for(path);
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(object_type: &str, id: &str) -> Dict {
        let mut d = Dict::new();
        d.set("id", id).set("type", object_type);
        d
    }

    #[tokio::test]
    async fn test_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DirStorage::open(tmp.path()).unwrap();
        let path: StoragePath = "/procedure/demo/hello".parse().unwrap();

        storage.store(&path, obj("procedure", "demo/hello")).await.unwrap();
        assert!(tmp.path().join("procedure/demo/hello.json").is_file());

        let loaded = storage.load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.str_or("id", ""), "demo/hello");

        storage.remove(&path).await.unwrap();
        assert!(storage.load(&path).await.unwrap().is_none());
        // removing again is not an error
        storage.remove(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DirStorage::open(tmp.path()).unwrap();
        let path: StoragePath = "/user/ghost".parse().unwrap();
        assert!(storage.load(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("user")).unwrap();
        std::fs::write(tmp.path().join("user/bad.json"), "{oops").unwrap();
        let storage = DirStorage::open(tmp.path()).unwrap();
        let path: StoragePath = "/user/bad".parse().unwrap();
        assert!(matches!(
            storage.load(&path).await,
            Err(Error::BadObject { .. })
        ));
    }

    #[tokio::test]
    async fn test_query_walks_subtree() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DirStorage::open(tmp.path()).unwrap();
        for (t, id) in [("session", "s1"), ("session", "s2"), ("user", "admin")] {
            let path: StoragePath = format!("/{}/{}", t, id).parse().unwrap();
            storage.store(&path, obj(t, id)).await.unwrap();
        }

        let prefix: StoragePath = "/session/".parse().unwrap();
        let found: Vec<Metadata> = storage.query(&prefix).collect().await;
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|m| m.object_type == "session"));

        let all: Vec<Metadata> = storage.query(&StoragePath::root()).collect().await;
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let rw = DirStorage::open(tmp.path()).unwrap();
            let path: StoragePath = "/role/admin".parse().unwrap();
            rw.store(&path, obj("role", "admin")).await.unwrap();
        }
        let ro = DirStorage::open_read_only(tmp.path()).unwrap();
        let path: StoragePath = "/role/admin".parse().unwrap();
        assert!(ro.load(&path).await.unwrap().is_some());
        assert!(matches!(
            ro.store(&path, obj("role", "admin")).await,
            Err(Error::ReadOnly(_))
        ));
    }
}
