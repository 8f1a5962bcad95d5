//! Manifest diff and bounded-concurrency download pipeline.

use std::sync::Arc;

use bytes::Bytes;
use common::prelude::{hash_to_filename, validate_file, FileInfo, FileList, SyncConfig};
use storage::prelude::{Storage, StorageError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::client::{ApiError, CoordinatorClient};
use crate::token::{TokenError, TokenManager};

pub const DOWNLOAD_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("storage is not ready")]
    StorageNotReady,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("failed to download {path} after {attempts} attempts: {source}")]
    Download {
        path: String,
        attempts: usize,
        source: ApiError,
    },
    #[error("content of {path} does not match hash {hash}")]
    Validation { path: String, hash: String },
    #[error("download worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("sync was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: CoordinatorClient,
    tokens: Arc<TokenManager>,
    storage: Arc<dyn Storage>,
}

impl Downloader {
    pub fn new(
        client: CoordinatorClient,
        tokens: Arc<TokenManager>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            client,
            tokens,
            storage,
        }
    }

    /// Bring storage up to date with `list`. Returns how many files were
    /// fetched. The first failing file aborts the whole batch.
    pub async fn sync(&self, list: &FileList, config: &SyncConfig) -> Result<usize, SyncError> {
        if !self.storage.check().await {
            return Err(SyncError::StorageNotReady);
        }

        tracing::info!(files = list.len(), "checking for missing files");
        let missing = self.storage.get_missing_files(&list.files).await?;
        if missing.is_empty() {
            tracing::info!("no missing files");
            return Ok(0);
        }

        let total = missing.len();
        let concurrency = config.concurrency.max(1);
        tracing::info!(
            missing = total,
            concurrency,
            source = %config.source,
            "starting sync"
        );

        let permits = Arc::new(Semaphore::new(concurrency));
        let mut workers = JoinSet::new();
        for file in missing {
            let downloader = self.clone();
            let permits = permits.clone();
            workers.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| SyncError::Cancelled)?;
                downloader.fetch(&file).await
            });
        }

        let mut done = 0usize;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(SyncError::from).and_then(|r| r);
            if let Err(e) = result {
                tracing::error!(error = %e, "sync aborted");
                workers.abort_all();
                return Err(e);
            }
            done += 1;
            if done % 1000 == 0 {
                tracing::info!(done, total, "sync progress");
            }
        }

        tracing::info!(files = total, "sync completed");
        Ok(total)
    }

    /// Download, validate, then store a single file.
    pub async fn fetch(&self, file: &FileInfo) -> Result<(), SyncError> {
        let content = self.download(file).await?;
        if !validate_file(&content, &file.hash) {
            return Err(SyncError::Validation {
                path: file.path.clone(),
                hash: file.hash.clone(),
            });
        }

        self.storage
            .write_file(&hash_to_filename(&file.hash), content, file)
            .await?;
        tracing::debug!(path = %file.path, hash = %file.hash, "downloaded");
        Ok(())
    }

    async fn download(&self, file: &FileInfo) -> Result<Bytes, SyncError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let token = self.tokens.get_token().await?;
            match self.client.get_bytes(&file.path, &[], Some(&token)).await {
                Ok(response) => return Ok(response.body),
                Err(e) if attempt < DOWNLOAD_ATTEMPTS => {
                    tracing::warn!(path = %file.path, attempt, error = %e, "download failed, retrying");
                }
                Err(e) => {
                    return Err(SyncError::Download {
                        path: file.path.clone(),
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }
}
