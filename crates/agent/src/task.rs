use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// A loop that runs a job every `interval` until cancelled.
///
/// Cancellation is checked between runs; a run in progress is allowed to
/// finish (up to a short grace period on `stop`).
#[derive(Debug)]
pub struct RepeatingTask {
    name: &'static str,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = cancelled.changed() => {
                        // handle dropped
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                if *cancelled.borrow() {
                    break;
                }
                job().await;
            }
            tracing::debug!(task = name, "repeating task stopped");
        });

        Self {
            name,
            cancel,
            handle,
        }
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn stop(mut self) {
        self.cancel();
        if timeout(STOP_GRACE, &mut self.handle).await.is_err() {
            tracing::warn!(task = self.name, "task did not stop in time, aborting");
            self.handle.abort();
        }
    }
}
