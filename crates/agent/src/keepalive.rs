//! Periodic liveness report with kick and failure detection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::prelude::{CounterSnapshot, Counters, KeepAliveRequest};
use parking_lot::Mutex;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::cluster::{ClusterControl, ClusterError};
use crate::control::Ack;
use crate::task::RepeatingTask;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_FAILURES: u32 = 3;
pub const RESTART_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// What one keepalive attempt ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    Reported(CounterSnapshot),
    /// Failed, with the number of consecutive failures so far.
    Failed(u32),
    Restarted,
    RestartFailed(String),
}

#[derive(Debug, thiserror::Error)]
enum RestartError {
    #[error("{0}")]
    Cluster(#[from] ClusterError),
    #[error("restart did not finish within {0:?}")]
    Timeout(Duration),
}

pub struct KeepaliveService {
    cluster: Arc<dyn ClusterControl>,
    counters: Arc<Counters>,
    failures: AtomicU32,
    interval: Duration,
    task: Mutex<Option<RepeatingTask>>,
    fatal: Option<watch::Sender<()>>,
}

impl KeepaliveService {
    pub fn new(cluster: Arc<dyn ClusterControl>, counters: Arc<Counters>) -> Self {
        Self {
            cluster,
            counters,
            failures: AtomicU32::new(0),
            interval: KEEPALIVE_INTERVAL,
            task: Mutex::new(None),
            fatal: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Signalled when a restart fails and the node cannot recover on its own.
    pub fn with_fatal_signal(mut self, fatal: watch::Sender<()>) -> Self {
        self.fatal = Some(fatal);
        self
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn start(self: &Arc<Self>) {
        let service = self.clone();
        let task = RepeatingTask::spawn("keepalive", self.interval, move || {
            let service = service.clone();
            async move {
                if let KeepaliveOutcome::RestartFailed(reason) = service.tick().await {
                    tracing::error!(reason = %reason, "cluster restart failed, node cannot recover");
                    if let Some(fatal) = &service.fatal {
                        let _ = fatal.send(());
                    }
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.cancel();
        }
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// One report attempt. Never fails; the outcome says what happened.
    pub async fn tick(&self) -> KeepaliveOutcome {
        let snapshot = self.counters.snapshot();
        let ack = match timeout(KEEPALIVE_TIMEOUT, self.emit(snapshot)).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "keep alive failed");
                return self.record_failure().await;
            }
            Err(_) => {
                tracing::error!("keep alive timeout");
                return self.record_failure().await;
            }
        };

        match ack {
            Ack::Success(accepted) => {
                self.failures.store(0, Ordering::Release);
                self.counters.drain(snapshot);
                tracing::info!(
                    hits = snapshot.hits,
                    bytes = snapshot.bytes,
                    accepted = %accepted,
                    "keep alive success"
                );
                KeepaliveOutcome::Reported(snapshot)
            }
            Ack::Kicked => {
                tracing::error!("kicked by the coordinator, restarting");
                self.restart().await
            }
            Ack::Failure(reason) => {
                tracing::error!(reason = %reason, "keep alive rejected");
                self.record_failure().await
            }
        }
    }

    async fn emit(&self, snapshot: CounterSnapshot) -> Result<Ack, ClusterError> {
        if !self.cluster.is_enabled() {
            return Err(ClusterError::NotEnabled);
        }
        let time = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let report = KeepAliveRequest {
            time,
            hits: snapshot.hits,
            bytes: snapshot.bytes,
        };
        self.cluster.keep_alive(&report).await
    }

    async fn record_failure(&self) -> KeepaliveOutcome {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= MAX_FAILURES {
            tracing::error!(failures, "too many keep alive failures, restarting");
            self.restart().await
        } else {
            KeepaliveOutcome::Failed(failures)
        }
    }

    async fn restart(&self) -> KeepaliveOutcome {
        self.failures.store(0, Ordering::Release);
        let cycle = async {
            self.cluster.disable().await?;
            tokio::time::sleep(RESTART_PAUSE).await;
            self.cluster.connect().await?;
            self.cluster.enable().await?;
            Ok::<(), RestartError>(())
        };

        let result = match timeout(RESTART_TIMEOUT, cycle).await {
            Ok(result) => result,
            Err(_) => Err(RestartError::Timeout(RESTART_TIMEOUT)),
        };
        match result {
            Ok(()) => {
                tracing::info!("cluster restarted");
                KeepaliveOutcome::Restarted
            }
            Err(e) => KeepaliveOutcome::RestartFailed(e.to_string()),
        }
    }
}
