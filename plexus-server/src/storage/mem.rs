//! In-memory storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::path::StoragePath;

use super::{Metadata, Storage};

/// Storage keeping all objects in a process-local map
///
/// Used for runtime-only state and as the test substrate. Optionally
/// read-only (e.g. when seeded with fixture data).
#[derive(Debug, Default)]
pub struct MemStorage {
    entries: DashMap<StoragePath, (Dict, DateTime<Utc>)>,
    read_only: bool,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, bypassing the read-only flag
    pub fn seed(&self, path: impl Into<StoragePath>, data: Dict) {
        self.entries.insert(path.into(), (data, Utc::now()));
    }

    /// Freeze this storage against further writes
    pub fn into_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Storage for MemStorage {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn query<'a>(&'a self, prefix: &StoragePath) -> BoxStream<'a, Metadata> {
        let mut found: Vec<Metadata> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| {
                let (dict, modified) = entry.value();
                Metadata::new(entry.key().clone(), dict.str_or("type", ""))
                    .with_modified(*modified)
            })
            .collect();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        stream::iter(found).boxed()
    }

    async fn load(&self, path: &StoragePath) -> Result<Option<Dict>> {
        Ok(self.entries.get(path).map(|e| e.value().0.clone()))
    }

    async fn store(&self, path: &StoragePath, data: Dict) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(path.to_string()));
        }
        self.entries.insert(path.clone(), (data, Utc::now()));
        Ok(())
    }

    async fn remove(&self, path: &StoragePath) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(path.to_string()));
        }
        self.entries.remove(path);
        Ok(())
    }
}
