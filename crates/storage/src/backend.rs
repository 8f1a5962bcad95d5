//! The contract every storage backend implements.

use std::fmt::Debug;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use common::prelude::{FileInfo, GcCounter};

use crate::error::Result;

/// How the HTTP layer should answer a download once a backend has
/// resolved it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeAction {
    /// Stream a local file (range requests honoured by the server).
    File(PathBuf),
    /// Send these bytes as the body.
    Bytes(Bytes),
    /// Temporary redirect to a URL that serves the content.
    Redirect(String),
    /// Respond with a bare status code, nothing is accounted.
    Status(u16),
}

/// Rendering decision plus the traffic it should be accounted as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeResult {
    pub action: ServeAction,
    pub bytes: u64,
    pub hits: u64,
}

impl ServeResult {
    pub fn new(action: ServeAction, bytes: u64, hits: u64) -> Self {
        Self {
            action,
            bytes,
            hits,
        }
    }

    /// A zero-length body for content stored as an empty file.
    pub fn empty() -> Self {
        Self::new(ServeAction::Bytes(Bytes::new()), 0, 1)
    }

    pub fn status(code: u16) -> Self {
        Self::new(ServeAction::Status(code), 0, 0)
    }
}

/// Content-addressed store of manifest files.
///
/// Paths passed in are always `hash[0:2]/hash`. Every operation is safe to
/// call on its own; `check` is the readiness gate the sync pipeline runs
/// first.
#[async_trait]
pub trait Storage: Debug + Send + Sync {
    /// Short backend name, reported in the enable flavor.
    fn name(&self) -> &'static str;

    /// One-time setup, such as creating the remote base directory.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Write and remove a probe object. `false` on any failure.
    async fn check(&self) -> bool;

    async fn exists(&self, path: &str) -> bool;

    async fn write_file(&self, path: &str, content: Bytes, file: &FileInfo) -> Result<()>;

    /// Every manifest entry that is absent or stored with another size.
    /// Entries sharing a hash are reported once.
    async fn get_missing_files(&self, files: &[FileInfo]) -> Result<Vec<FileInfo>>;

    /// Delete every stored object whose hash is not in `files`.
    async fn gc(&self, files: &[FileInfo]) -> Result<GcCounter>;

    async fn serve_file(&self, path: &str, name: Option<&str>) -> Result<ServeResult>;
}
