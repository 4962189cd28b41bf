//! # Worker Pool
//!
//! Bounded execution of long-latency calls (identity provider round trips,
//! broker handshakes) so a slow endpoint cannot pile up unbounded tasks.
//!
//! ```text
//!   caller ──run(fut)──► acquire permit ──► tokio::spawn(fut) ──► result
//!                              │
//!                    close() ──┘ pending and future run() calls fail
//!                                with SyncError::ClientClosed
//! ```

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::error;

use crate::error::{SyncError, SyncResult};

/// Semaphore-gated task runner shared by the credential store and session.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.max_workers)
            .field("available_permits", &self.permits.available_permits())
            .field("closed", &self.permits.is_closed())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Runs `fut` on its own task once a permit is free.
    ///
    /// The permit is held until the task finishes, even if the caller stops
    /// waiting for it.
    pub async fn run<F, T>(&self, fut: F) -> SyncResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::ClientClosed)?;

        let task = tokio::spawn(async move {
            let _permit = permit;
            fut.await
        });

        task.await.map_err(|e| {
            if e.is_panic() {
                error!("Worker task panicked");
                SyncError::client("Worker task panicked", e)
            } else {
                SyncError::ClientClosed
            }
        })
    }

    /// Number of tasks currently holding a permit.
    pub fn active(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    /// Refuses new work. Tasks already running are left to finish.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
