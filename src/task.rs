//! Handle for periodic background tasks
//!
//! Background loops (collector auto-flush, retention cleanup) are started
//! explicitly and stopped through the returned handle instead of living for
//! the whole process.

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct BackgroundTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `body` with a shutdown receiver it must watch
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(body(rx));
        tracing::debug!(task = name, "Background task started");

        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal shutdown and wait for the loop to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(task = self.name, error = %e, "Background task ended abnormally");
        } else {
            tracing::debug!(task = self.name, "Background task stopped");
        }
    }
}

/// Resolves once shutdown has been requested (or the handle was dropped)
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
