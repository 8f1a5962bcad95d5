//! WebDAV backend.

mod client;
mod propfind;

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use common::prelude::{FileInfo, GcCounter};
use parking_lot::RwLock;

pub use client::{DavEntry, WebdavClient};

use crate::backend::{ServeAction, ServeResult, Storage};
use crate::error::{Result, StorageError};
use crate::index::{hash_of, unique_by_hash, RemoteIndex};
use crate::options::StorageOptions;

#[derive(Debug, Clone)]
pub struct WebdavConfig {
    pub url: String,
    pub base_path: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl WebdavConfig {
    pub fn from_options(options: &StorageOptions) -> Result<Self> {
        let url = options.required("url")?;
        let base_path = options.required("basePath")?;
        if base_path.trim_matches('/').is_empty() {
            return Err(StorageError::InvalidConfig(
                "webdav basePath must not be empty".to_string(),
            ));
        }
        Ok(Self {
            url,
            base_path,
            username: options.get("username"),
            password: options.get("password"),
        })
    }
}

#[derive(Debug)]
pub struct WebdavStorage {
    client: WebdavClient,
    index: RemoteIndex,
    /// Zero-length content is never uploaded, only remembered.
    empty_files: RwLock<HashSet<String>>,
}

impl WebdavStorage {
    pub fn new(config: WebdavConfig) -> Result<Self> {
        let client = WebdavClient::new(
            &config.url,
            &config.base_path,
            config.username,
            config.password,
        )?;
        Ok(Self {
            client,
            index: RemoteIndex::new(),
            empty_files: RwLock::new(HashSet::new()),
        })
    }

    pub fn client(&self) -> &WebdavClient {
        &self.client
    }

    pub fn is_empty_file(&self, path: &str) -> bool {
        self.empty_files.read().contains(path)
    }

    /// Size recorded for the object at `path`, zero when unknown.
    pub fn known_size(&self, path: &str) -> u64 {
        self.index.size_of(hash_of(path)).unwrap_or(0)
    }

    async fn probe(&self) -> Result<()> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        self.client
            .put(".check", Bytes::from(stamp.to_string()))
            .await
    }

    async fn remove_probe(&self) -> Result<()> {
        self.client.delete(self.client.url_for(".check")?).await
    }
}

#[async_trait]
impl Storage for WebdavStorage {
    fn name(&self) -> &'static str {
        "webdav"
    }

    async fn init(&self) -> Result<()> {
        if !self.client.exists("").await? {
            tracing::info!(base = %self.client.base(), "creating webdav base path");
            self.client.ensure_base().await?;
        }
        Ok(())
    }

    async fn check(&self) -> bool {
        let result = self.probe().await;
        if let Err(e) = self.remove_probe().await {
            tracing::warn!(error = %e, "failed to delete webdav check file");
        }
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "storage check failed");
                false
            }
        }
    }

    async fn exists(&self, path: &str) -> bool {
        if self.is_empty_file(path) {
            return true;
        }
        self.client.exists(path).await.unwrap_or(false)
    }

    async fn write_file(&self, path: &str, content: Bytes, file: &FileInfo) -> Result<()> {
        if content.is_empty() {
            self.empty_files.write().insert(path.to_string());
            return Ok(());
        }

        self.client.ensure_parent(path).await?;
        let size = content.len() as u64;
        self.client.put(path, content).await?;
        self.index.insert(&file.hash, size, &file.path);
        Ok(())
    }

    async fn get_missing_files(&self, files: &[FileInfo]) -> Result<Vec<FileInfo>> {
        if !self.index.is_empty() {
            return Ok(self.index.missing(files));
        }

        let wanted: HashMap<&str, &FileInfo> =
            files.iter().map(|f| (f.hash.as_str(), f)).collect();
        let mut present = HashSet::new();
        for entry in self.client.walk().await? {
            if let Some(file) = wanted.get(entry.name.as_str()) {
                if file.size == entry.size {
                    self.index.insert(&entry.name, entry.size, entry.url.path());
                    present.insert(entry.name);
                }
            }
        }

        let empty = self.empty_files.read();
        Ok(unique_by_hash(files)
            .into_iter()
            .filter(|f| !present.contains(&f.hash) && !empty.contains(&f.storage_path()))
            .collect())
    }

    async fn gc(&self, files: &[FileInfo]) -> Result<GcCounter> {
        let live: HashSet<&str> = files.iter().map(|f| f.hash.as_str()).collect();
        let mut counter = GcCounter::default();

        for entry in self.client.walk().await? {
            if live.contains(entry.name.as_str()) {
                continue;
            }
            tracing::info!(path = %entry.url.path(), "deleting expired file");
            match self.client.delete(entry.url.clone()).await {
                Ok(()) => {
                    self.index.remove(&entry.name);
                    counter.record(entry.size);
                }
                Err(e) => {
                    tracing::warn!(path = %entry.url.path(), error = %e, "failed to delete file")
                }
            }
        }

        self.empty_files
            .write()
            .retain(|path| live.contains(hash_of(path)));

        Ok(counter)
    }

    async fn serve_file(&self, path: &str, _name: Option<&str>) -> Result<ServeResult> {
        if self.is_empty_file(path) {
            return Ok(ServeResult::empty());
        }
        let url = self.client.url_for(path)?;
        Ok(ServeResult::new(
            ServeAction::Redirect(url.to_string()),
            self.known_size(path),
            1,
        ))
    }
}
