//! In-process `{hash -> (size, path)}` cache used by the remote backends so
//! that repeated diffs do not relist the whole namespace.

use std::collections::{HashMap, HashSet};

use common::prelude::FileInfo;
use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub size: u64,
    pub path: String,
}

#[derive(Debug, Default)]
pub struct RemoteIndex {
    entries: RwLock<HashMap<String, RemoteEntry>>,
}

impl RemoteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn insert(&self, hash: &str, size: u64, path: impl Into<String>) {
        self.entries.write().insert(
            hash.to_string(),
            RemoteEntry {
                size,
                path: path.into(),
            },
        );
    }

    pub fn remove(&self, hash: &str) {
        self.entries.write().remove(hash);
    }

    pub fn size_of(&self, hash: &str) -> Option<u64> {
        self.entries.read().get(hash).map(|e| e.size)
    }

    /// Manifest entries with no cached counterpart.
    pub fn missing(&self, files: &[FileInfo]) -> Vec<FileInfo> {
        let entries = self.entries.read();
        unique_by_hash(files)
            .into_iter()
            .filter(|f| !entries.contains_key(&f.hash))
            .collect()
    }
}

/// First occurrence of each hash, in manifest order.
pub fn unique_by_hash(files: &[FileInfo]) -> Vec<FileInfo> {
    let mut seen = HashSet::new();
    files
        .iter()
        .filter(|f| seen.insert(f.hash.as_str()))
        .cloned()
        .collect()
}

/// The hash a stored object answers to: the last path segment.
pub fn hash_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
