use std::collections::VecDeque;

use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use url::Url;

use super::propfind::{parse_multistatus, PROPFIND_BODY};
use crate::error::{Result, StorageError};

/// A resource found while walking the WebDAV tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    pub url: Url,
    pub name: String,
    pub size: u64,
}

/// Thin WebDAV client shared by the `webdav` and `alist` backends.
#[derive(Debug, Clone)]
pub struct WebdavClient {
    http: Client,
    /// `url/basePath/`, always with a trailing slash.
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

fn method(name: &'static [u8]) -> Method {
    Method::from_bytes(name).unwrap_or(Method::GET)
}

impl WebdavClient {
    pub fn new(
        url: &str,
        base_path: &str,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self> {
        let mut base = Url::parse(&format!(
            "{}/{}/",
            url.trim_end_matches('/'),
            base_path.trim_matches('/')
        ))?;
        // credentials travel in the Authorization header, never in URLs we hand out
        let username = username.or_else(|| {
            (!base.username().is_empty()).then(|| base.username().to_string())
        });
        let password = password.or_else(|| base.password().map(str::to_string));
        let _ = base.set_username("");
        let _ = base.set_password(None);

        let http = Client::builder()
            .user_agent(common::version::user_agent())
            .build()?;

        Ok(Self {
            http,
            base,
            username,
            password,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn url_for(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    /// Attach credentials to a request built on any client.
    pub fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.authorize(self.http.request(method, url))
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let url = self.url_for(path)?;
        let response = self
            .request(method(b"PROPFIND"), url.clone())
            .header("Depth", "0")
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StorageError::HttpStatus(s, url.to_string())),
        }
    }

    /// Create a collection; an existing one is not an error.
    pub async fn mkcol(&self, url: Url) -> Result<()> {
        let response = self.request(method(b"MKCOL"), url.clone()).send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            s => Err(StorageError::HttpStatus(s, url.to_string())),
        }
    }

    /// Create every collection from the server root down to `base`.
    pub async fn ensure_base(&self) -> Result<()> {
        let segments: Vec<String> = self
            .base
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        let mut url = self.base.clone();
        url.set_path("/");
        for segment in segments {
            url = url.join(&format!("{}/", segment))?;
            self.mkcol(url.clone()).await?;
        }
        Ok(())
    }

    /// Create the parent collections of `path` below `base`.
    pub async fn ensure_parent(&self, path: &str) -> Result<()> {
        let mut url = self.base.clone();
        let mut segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        segments.pop();
        for segment in segments {
            url = url.join(&format!("{}/", segment))?;
            self.mkcol(url.clone()).await?;
        }
        Ok(())
    }

    pub async fn put(&self, path: &str, content: Bytes) -> Result<()> {
        let url = self.url_for(path)?;
        let response = self
            .request(Method::PUT, url.clone())
            .header("Content-Type", "application/octet-stream")
            .body(content)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::HttpStatus(response.status(), url.to_string()));
        }
        Ok(())
    }

    pub async fn delete(&self, url: Url) -> Result<()> {
        let response = self.request(Method::DELETE, url.clone()).send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            s => Err(StorageError::HttpStatus(s, url.to_string())),
        }
    }

    /// PROPFIND with `Depth: 1`, returning (entry, is_collection) pairs
    /// excluding `dir` itself.
    pub async fn list(&self, dir: &Url) -> Result<Vec<(DavEntry, bool)>> {
        let response = self
            .request(method(b"PROPFIND"), dir.clone())
            .header("Depth", "1")
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::HttpStatus(response.status(), dir.to_string()));
        }
        let body = response.text().await?;

        let mut entries = Vec::new();
        for raw in parse_multistatus(&body)? {
            let url = dir.join(&raw.href)?;
            if url.path().trim_end_matches('/') == dir.path().trim_end_matches('/') {
                continue;
            }
            let name = url
                .path_segments()
                .and_then(|s| s.filter(|s| !s.is_empty()).last())
                .unwrap_or_default()
                .to_string();
            let mut url = url;
            if raw.is_dir && !url.path().ends_with('/') {
                let path = format!("{}/", url.path());
                url.set_path(&path);
            }
            entries.push((
                DavEntry {
                    url,
                    name,
                    size: raw.size,
                },
                raw.is_dir,
            ));
        }
        Ok(entries)
    }

    /// Breadth-first walk of every file below `base`. Directories that
    /// fail to list are logged and skipped.
    pub async fn walk(&self) -> Result<Vec<DavEntry>> {
        let mut files = Vec::new();
        let mut queue = VecDeque::from([self.base.clone()]);
        let mut first = true;

        while let Some(dir) = queue.pop_front() {
            match self.list(&dir).await {
                Ok(entries) => {
                    for (entry, is_dir) in entries {
                        if is_dir {
                            queue.push_back(entry.url);
                        } else {
                            files.push(entry);
                        }
                    }
                }
                // a broken root means we know nothing, surface it
                Err(e) if first => return Err(e),
                Err(e) => tracing::error!(dir = %dir, error = %e, "failed to list webdav directory"),
            }
            first = false;
        }

        Ok(files)
    }
}
