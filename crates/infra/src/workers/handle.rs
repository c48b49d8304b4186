//! Shutdown handle shared by all background workers.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Handle to a spawned worker loop.
///
/// Dropping the handle detaches the worker; call [`WorkerHandle::shutdown`]
/// for an orderly stop that lets an in-flight tick finish.
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(
        name: &'static str,
        shutdown: watch::Sender<bool>,
        join: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            shutdown,
            join,
        }
    }

    /// Signal the worker to stop and wait for its loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(worker = self.name, error = %e, "worker task did not exit cleanly");
        }
    }
}
