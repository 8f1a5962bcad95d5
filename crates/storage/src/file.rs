//! Local filesystem backend rooted at the cache directory.

use std::collections::{HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use common::prelude::{hash_to_filename, FileInfo, GcCounter};

use crate::backend::{ServeAction, ServeResult, Storage};
use crate::error::Result;
use crate::index::unique_by_hash;

const CHECK_FILE: &str = ".check";

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn probe(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let check = self.root.join(CHECK_FILE);
        tokio::fs::write(&check, b"").await?;
        tokio::fs::remove_file(&check).await
    }

    /// `a/b/c` relative to the root, always with forward slashes.
    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[derive(Debug)]
struct StaleFile {
    path: PathBuf,
    relative: String,
    size: u64,
}

/// Delete what the walk found. A file that cannot be removed is logged,
/// skipped and left out of the count.
async fn sweep(stale: Vec<StaleFile>) -> GcCounter {
    let mut counter = GcCounter::default();
    for file in stale {
        tracing::info!(path = %file.relative, "deleting expired file");
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => counter.record(file.size),
            Err(e) => tracing::warn!(path = %file.relative, error = %e, "failed to delete file"),
        }
    }
    counter
}

#[async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn check(&self) -> bool {
        match self.probe().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(root = ?self.root, error = %e, "storage check failed");
                false
            }
        }
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.full_path(path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn write_file(&self, path: &str, content: Bytes, _file: &FileInfo) -> Result<()> {
        let target = self.full_path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // never leave a half-written file under its final name
        let mut staging = target.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, &content).await?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get_missing_files(&self, files: &[FileInfo]) -> Result<Vec<FileInfo>> {
        let mut missing = Vec::new();
        for file in unique_by_hash(files) {
            let path = self.full_path(&hash_to_filename(&file.hash));
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() && meta.len() == file.size => {}
                Ok(_) => missing.push(file),
                Err(e) if e.kind() == ErrorKind::NotFound => missing.push(file),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(missing)
    }

    async fn gc(&self, files: &[FileInfo]) -> Result<GcCounter> {
        let live: HashSet<String> = files.iter().map(|f| hash_to_filename(&f.hash)).collect();
        let mut stale = Vec::new();

        let mut queue = VecDeque::from([self.root.clone()]);
        while let Some(dir) = queue.pop_front() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(dir = ?dir, error = %e, "failed to read directory during gc");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(dir = ?dir, error = %e, "failed to list directory during gc");
                        break;
                    }
                };
                let path = entry.path();
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(e) => {
                        tracing::warn!(path = ?path, error = %e, "failed to stat during gc");
                        continue;
                    }
                };
                if meta.is_dir() {
                    queue.push_back(path);
                    continue;
                }

                let Some(relative) = self.relative(&path) else {
                    continue;
                };
                if !live.contains(&relative) {
                    stale.push(StaleFile {
                        path,
                        relative,
                        size: meta.len(),
                    });
                }
            }
        }

        Ok(sweep(stale).await)
    }

    async fn serve_file(&self, path: &str, _name: Option<&str>) -> Result<ServeResult> {
        let full = self.full_path(path);
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => Ok(ServeResult::new(
                ServeAction::File(full),
                meta.len(),
                1,
            )),
            Ok(_) => Ok(ServeResult::status(404)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ServeResult::status(404)),
            Err(e) => Err(e.into()),
        }
    }
}
