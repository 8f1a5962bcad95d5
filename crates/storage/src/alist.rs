//! Alist flavoured WebDAV: the WebDAV backend plus resolution and caching of
//! the redirect Alist answers downloads with.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::prelude::{FileInfo, GcCounter};
use moka::future::Cache;
use reqwest::{header::LOCATION, redirect::Policy, Client};

use crate::backend::{ServeAction, ServeResult, Storage};
use crate::error::Result;
use crate::options::StorageOptions;
use crate::webdav::{WebdavConfig, WebdavStorage};

pub const DEFAULT_CACHE_TTL_MS: u64 = 3_600_000;

const MAX_CACHED_REDIRECTS: u64 = 100_000;

#[derive(Debug, Clone)]
pub struct AlistConfig {
    pub webdav: WebdavConfig,
    pub cache_ttl: Duration,
}

impl AlistConfig {
    pub fn from_options(options: &StorageOptions) -> Result<Self> {
        let ttl = options.u64_or("cacheTtl", DEFAULT_CACHE_TTL_MS)?;
        if ttl == 0 {
            return Err(crate::error::StorageError::InvalidConfig(
                "cacheTtl must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            webdav: WebdavConfig::from_options(options)?,
            cache_ttl: Duration::from_millis(ttl),
        })
    }
}

#[derive(Debug)]
pub struct AlistStorage {
    webdav: WebdavStorage,
    http: Client,
    redirects: Cache<String, Arc<str>>,
}

impl AlistStorage {
    pub fn new(config: AlistConfig) -> Result<Self> {
        let http = Client::builder()
            .redirect(Policy::none())
            .user_agent(common::version::user_agent())
            .build()?;
        let redirects = Cache::builder()
            .max_capacity(MAX_CACHED_REDIRECTS)
            .time_to_live(config.cache_ttl)
            .build();

        Ok(Self {
            webdav: WebdavStorage::new(config.webdav)?,
            http,
            redirects,
        })
    }
}

#[async_trait]
impl Storage for AlistStorage {
    fn name(&self) -> &'static str {
        "alist"
    }

    async fn init(&self) -> Result<()> {
        self.webdav.init().await
    }

    async fn check(&self) -> bool {
        self.webdav.check().await
    }

    async fn exists(&self, path: &str) -> bool {
        self.webdav.exists(path).await
    }

    async fn write_file(&self, path: &str, content: Bytes, file: &FileInfo) -> Result<()> {
        self.webdav.write_file(path, content, file).await
    }

    async fn get_missing_files(&self, files: &[FileInfo]) -> Result<Vec<FileInfo>> {
        self.webdav.get_missing_files(files).await
    }

    async fn gc(&self, files: &[FileInfo]) -> Result<GcCounter> {
        self.webdav.gc(files).await
    }

    async fn serve_file(&self, path: &str, _name: Option<&str>) -> Result<ServeResult> {
        if self.webdav.is_empty_file(path) {
            return Ok(ServeResult::empty());
        }

        let size = self.webdav.known_size(path);
        if let Some(location) = self.redirects.get(path).await {
            return Ok(ServeResult::new(
                ServeAction::Redirect(location.to_string()),
                size,
                1,
            ));
        }

        let client = self.webdav.client();
        let url = client.url_for(path)?;
        let response = client.authorize(self.http.get(url.clone())).send().await?;
        let status = response.status();

        if status.is_success() {
            let body = response.bytes().await?;
            let len = body.len() as u64;
            return Ok(ServeResult::new(ServeAction::Bytes(body), len, 1));
        }

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| url.join(v).ok());
            if let Some(location) = location {
                let location: Arc<str> = Arc::from(location.as_str());
                self.redirects
                    .insert(path.to_string(), location.clone())
                    .await;
                return Ok(ServeResult::new(
                    ServeAction::Redirect(location.to_string()),
                    size,
                    1,
                ));
            }
        }

        tracing::warn!(path, status = %status, "alist did not serve file");
        Ok(ServeResult::status(status.as_u16()))
    }
}
