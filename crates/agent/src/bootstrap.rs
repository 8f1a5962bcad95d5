//! Startup sequence, periodic manifest recheck and ordered shutdown.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use storage::prelude::Storage;
use tokio::task::JoinHandle;

use crate::cluster::{ClusterError, ClusterService};
use crate::keepalive::KeepaliveService;
use crate::task::RepeatingTask;
use crate::token::{TokenError, TokenManager};

pub const RECHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to obtain token: {0}")]
    Token(#[from] TokenError),
    #[error("{0}")]
    Cluster(#[from] ClusterError),
    #[error("storage is not ready")]
    StorageNotReady,
}

/// Pulls files changed since the last seen modification time.
#[derive(Debug, Clone)]
struct Recheck {
    cluster: Arc<ClusterService>,
    last_modified: Arc<AtomicI64>,
    sweeping: Arc<tokio::sync::Mutex<()>>,
}

impl Recheck {
    async fn run_once(&self) -> Result<usize, BootstrapError> {
        // new files are not in the swept manifest
        let Ok(_sweep) = self.sweeping.try_lock() else {
            tracing::debug!("garbage collection still running, skipping recheck");
            return Ok(0);
        };

        let since = match self.last_modified.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        };
        let list = self.cluster.get_file_list(since).await?;
        if list.is_empty() {
            tracing::debug!("no new files");
            return Ok(0);
        }

        tracing::info!(files = list.len(), "new files in manifest");
        let configuration = self.cluster.get_configuration().await?;
        let synced = self.cluster.sync_files(&list, &configuration.sync).await?;
        if let Some(latest) = list.last_modified() {
            self.last_modified.fetch_max(latest, Ordering::AcqRel);
        }
        Ok(synced)
    }
}

pub struct BootstrapService {
    cluster: Arc<ClusterService>,
    storage: Arc<dyn Storage>,
    tokens: Arc<TokenManager>,
    keepalive: Arc<KeepaliveService>,
    last_modified: Arc<AtomicI64>,
    recheck: Mutex<Option<RepeatingTask>>,
    recheck_interval: Duration,
    sweeping: Arc<tokio::sync::Mutex<()>>,
    gc: Mutex<Option<JoinHandle<()>>>,
}

impl BootstrapService {
    pub fn new(
        cluster: Arc<ClusterService>,
        storage: Arc<dyn Storage>,
        tokens: Arc<TokenManager>,
        keepalive: Arc<KeepaliveService>,
    ) -> Self {
        Self {
            cluster,
            storage,
            tokens,
            keepalive,
            last_modified: Arc::new(AtomicI64::new(0)),
            recheck: Mutex::new(None),
            recheck_interval: RECHECK_INTERVAL,
            sweeping: Arc::new(tokio::sync::Mutex::new(())),
            gc: Mutex::new(None),
        }
    }

    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    /// Whether the startup garbage collection is still sweeping.
    pub fn is_collecting(&self) -> bool {
        self.gc.lock().as_ref().is_some_and(|gc| !gc.is_finished())
    }

    /// Latest modification time synced so far, 0 before the first sync.
    pub fn last_modified(&self) -> i64 {
        self.last_modified.load(Ordering::Acquire)
    }

    /// Bring the node from nothing to enabled.
    pub async fn bootstrap(&self) -> Result<(), BootstrapError> {
        self.tokens.get_token().await?;
        self.cluster.connect().await?;

        if !self.storage.check().await {
            return Err(BootstrapError::StorageNotReady);
        }

        let (configuration, list) = tokio::try_join!(
            self.cluster.get_configuration(),
            self.cluster.get_file_list(None),
        )?;
        tracing::info!(
            files = list.len(),
            concurrency = configuration.sync.concurrency,
            "fetched manifest"
        );

        self.cluster.sync_files(&list, &configuration.sync).await?;
        self.last_modified
            .store(list.last_modified().unwrap_or(0), Ordering::Release);

        // the list is complete and fully synced, safe to sweep against
        let storage = self.storage.clone();
        let sweep = self.sweeping.clone().lock_owned().await;
        let gc = tokio::spawn(async move {
            let _sweep = sweep;
            tracing::info!("starting garbage collection");
            match storage.gc(&list.files).await {
                Ok(counter) => tracing::info!(
                    count = counter.count,
                    size = counter.size,
                    "garbage collection finished"
                ),
                Err(e) => tracing::warn!(error = %e, "garbage collection failed"),
            }
        });
        if let Some(previous) = self.gc.lock().replace(gc) {
            previous.abort();
        }

        self.cluster.enable().await?;
        self.keepalive.start();
        self.start_recheck();
        Ok(())
    }

    fn start_recheck(&self) {
        let recheck = Recheck {
            cluster: self.cluster.clone(),
            last_modified: self.last_modified.clone(),
            sweeping: self.sweeping.clone(),
        };
        let task = RepeatingTask::spawn("recheck", self.recheck_interval, move || {
            let recheck = recheck.clone();
            async move {
                match recheck.run_once().await {
                    Ok(0) => {}
                    Ok(synced) => tracing::info!(synced, "recheck synced new files"),
                    Err(e) => tracing::error!(error = %e, "manifest recheck failed"),
                }
            }
        });
        if let Some(previous) = self.recheck.lock().replace(task) {
            previous.cancel();
        }
    }

    /// Tear down in dependency order.
    pub async fn shutdown(&self) {
        let recheck = self.recheck.lock().take();
        if let Some(recheck) = recheck {
            recheck.stop().await;
        }
        let gc = self.gc.lock().take();
        if let Some(gc) = gc {
            gc.abort();
        }
        self.keepalive.stop().await;
        if let Err(e) = self.cluster.disable().await {
            tracing::warn!(error = %e, "failed to disable cluster");
        }
        self.cluster.close().await;
        self.tokens.close();
        tracing::info!("cluster shut down");
    }
}
