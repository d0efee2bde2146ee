//! Hierarchical storage paths
//!
//! Every object in the layered store is addressed by an absolute,
//! slash-separated path. A path ending in `/` is an *index* path and denotes
//! a directory-like container rather than a single object. Paths are
//! immutable value types; all operations return new instances.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// An absolute storage path
///
/// Consists of an ordered list of non-empty segments plus a terminal
/// index flag. Comparison is case-sensitive and segment-wise, with the
/// index flag breaking ties (`/a/b` sorts before `/a/b/`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StoragePath {
    segments: Vec<String>,
    index: bool,
}

impl StoragePath {
    /// The root index path `/`
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
            index: true,
        }
    }

    /// Create an object path from segments
    pub fn object<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            index: false,
        }
    }

    /// Create an index path from segments
    pub fn index<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            index: true,
        }
    }

    /// True for the root path `/`
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if this path denotes a directory-like index
    pub fn is_index(&self) -> bool {
        self.index
    }

    /// Number of segments
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// The final segment, or `""` for the root path
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    /// The path segments in order
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The parent index path
    ///
    /// The parent of the root path is the root path itself.
    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self {
            segments,
            index: true,
        }
    }

    /// A child of this path
    ///
    /// Only meaningful on index paths, but not enforced; the child of an
    /// object path replaces that object's position in the hierarchy.
    pub fn child(&self, name: impl Into<String>, index: bool) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        Self { segments, index }
    }

    /// Resolve a relative path reference against this path
    ///
    /// Absolute references (leading `/`) ignore the base entirely. Relative
    /// references resolve against this path if it is an index, otherwise
    /// against its parent. `.` and `..` segments are interpreted.
    pub fn resolve(&self, reference: &str) -> Self {
        if reference.starts_with('/') {
            return reference.parse().unwrap_or_else(|_| Self::root());
        }
        let base = if self.index { self.clone() } else { self.parent() };
        let mut segments = base.segments;
        for part in reference.split('/').filter(|s| !s.is_empty()) {
            match part {
                "." => {}
                ".." => {
                    segments.pop();
                }
                _ => segments.push(part.to_string()),
            }
        }
        Self {
            segments,
            index: reference.ends_with('/') || reference.is_empty(),
        }
    }

    /// True if this path is equal to or located beneath `prefix`
    ///
    /// An index prefix covers its whole subtree; an object path covers
    /// only itself.
    pub fn starts_with(&self, prefix: &StoragePath) -> bool {
        if prefix.index {
            prefix.segments.len() <= self.segments.len()
                && self.segments[..prefix.segments.len()] == prefix.segments[..]
        } else {
            self == prefix
        }
    }

    /// The remainder of this path after stripping `prefix`, if covered
    pub fn strip_prefix(&self, prefix: &StoragePath) -> Option<StoragePath> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(Self {
            segments: self.segments[prefix.segments.len()..].to_vec(),
            index: self.index,
        })
    }

    /// Join a (relative) path under this one
    pub fn join(&self, rel: &StoragePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(rel.segments.iter().cloned());
        Self {
            segments,
            index: rel.index,
        }
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{}", seg)?;
        }
        if self.index {
            f.write_str("/")?;
        }
        Ok(())
    }
}

/// Error returned when parsing an invalid path string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid storage path: {0}")]
pub struct PathParseError(pub String);

impl FromStr for StoragePath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(PathParseError(s.to_string()));
        }
        let segments: Vec<String> = trimmed
            .split('/')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        let index = trimmed.ends_with('/') || segments.is_empty();
        Ok(Self { segments, index })
    }
}

impl From<&str> for StoragePath {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| Self::root())
    }
}

impl Serialize for StoragePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StoragePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
