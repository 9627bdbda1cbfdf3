//! Orphan controller: event bridge plus a fixed pool of reconcile workers.
//!
//! Workers share one queue. A key is held by one worker until `done`, so the
//! same orphan is never reconciled twice at once while different orphans
//! proceed in parallel.

use std::sync::Arc;

use keel_reconcile::{Classify, ErrorKind, RetryDecision, RetryPolicy, WorkQueue};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::cleanup::CleanupExecutor;
use crate::config::ControllerConfig;
use crate::disk_service::DiskServiceConnector;
use crate::error::ControllerError;
use crate::events::EventBridge;
use crate::reconciler::{OrphanReconciler, ReconcileOutcome};
use crate::store::DataStore;

/// Name of the orphan work queue.
pub const QUEUE_NAME: &str = "orphan";

/// Runs orphan reconciliation for one controller instance.
pub struct OrphanController {
    config: ControllerConfig,
    store: Arc<dyn DataStore>,
    queue: WorkQueue<String>,
    reconciler: Arc<OrphanReconciler>,
}

impl OrphanController {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn DataStore>,
        disk_service: Arc<dyn DiskServiceConnector>,
    ) -> Self {
        let queue = WorkQueue::new(QUEUE_NAME, config.backoff.clone());
        let cleanup = CleanupExecutor::new(
            config.controller_id.clone(),
            Arc::clone(&store),
            disk_service,
        );
        let reconciler = Arc::new(OrphanReconciler::new(
            config.controller_id.clone(),
            config.namespace.clone(),
            Arc::clone(&store),
            cleanup,
            queue.clone(),
        ));

        Self {
            config,
            store,
            queue,
            reconciler,
        }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    fn worker(&self, id: usize) -> Worker {
        Worker {
            id,
            queue: self.queue.clone(),
            reconciler: Arc::clone(&self.reconciler),
            retry: self.config.retry,
        }
    }

    /// Run until shutdown is signalled, then drain in-flight work.
    #[instrument(skip(self, shutdown), fields(controller_id = %self.config.controller_id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            namespace = %self.config.namespace,
            max_retries = self.config.retry.max_retries,
            "Starting orphan controller"
        );

        let mut tasks = JoinSet::new();

        let bridge = EventBridge::new(Arc::clone(&self.store), self.queue.clone());
        let bridge_shutdown = shutdown.clone();
        tasks.spawn(async move { bridge.run(bridge_shutdown).await });

        for id in 0..self.config.workers {
            let worker = self.worker(id);
            tasks.spawn(async move { worker.run().await });
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Orphan controller shutting down");
        self.queue.shut_down().await;

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Orphan controller task panicked");
            }
        }
        info!("Orphan controller stopped");
    }

    /// Take one key from the queue and reconcile it.
    ///
    /// Returns false once the queue is shut down.
    pub async fn process_next_work_item(&self) -> bool {
        self.worker(0).process_next_work_item().await
    }
}

struct Worker {
    id: usize,
    queue: WorkQueue<String>,
    reconciler: Arc<OrphanReconciler>,
    retry: RetryPolicy,
}

impl Worker {
    #[instrument(skip(self), fields(worker = self.id))]
    async fn run(self) {
        debug!("Worker started");
        while self.process_next_work_item().await {}
        debug!("Worker stopped");
    }

    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = self.reconciler.sync(&key).await;
        self.handle_result(&key, result).await;
        self.queue.done(&key).await;
        true
    }

    async fn handle_result(&self, key: &String, result: Result<ReconcileOutcome, ControllerError>) {
        let err = match result {
            Ok(outcome) => {
                debug!(orphan = %key, outcome = ?outcome, "Orphan synced");
                self.queue.forget(key).await;
                return;
            }
            Err(err) => err,
        };

        // Retrying cannot help; the Error condition already carries the cause.
        if err.kind() == ErrorKind::Fatal {
            error!(orphan = %key, error = %err, "Dropping orphan out of the queue, error is not retryable");
            self.queue.forget(key).await;
            return;
        }

        let requeues = self.queue.num_requeues(key).await;
        match self.retry.decide(requeues) {
            RetryDecision::Requeue => {
                if err.is_conflict() {
                    debug!(orphan = %key, error = %err, "Failed to sync orphan");
                } else {
                    warn!(orphan = %key, error = %err, requeues, "Failed to sync orphan");
                }
                self.queue.add_rate_limited(key.clone()).await;
            }
            RetryDecision::Drop => {
                error!(orphan = %key, error = %err, requeues, "Dropping orphan out of the queue");
                self.queue.forget(key).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keel_reconcile::BackoffPolicy;

    use super::*;
    use crate::cleanup::CleanupError;
    use crate::disk_service::MockDiskService;
    use crate::store::{MemoryStore, StoreError};

    fn controller() -> OrphanController {
        let config = ControllerConfig {
            retry: RetryPolicy { max_retries: 3 },
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
            ..ControllerConfig::new("node-1")
        };
        OrphanController::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MockDiskService::default()),
        )
    }

    fn unavailable() -> ControllerError {
        ControllerError::Store(StoreError::Unavailable("store down".to_string()))
    }

    #[tokio::test]
    async fn test_transient_error_requeued_up_to_cap() {
        let controller = controller();
        let worker = controller.worker(0);
        let key = "keel-system/orphan-1".to_string();

        for expected in 1..=3 {
            worker.handle_result(&key, Err(unavailable())).await;
            assert_eq!(controller.queue().num_requeues(&key).await, expected);
        }

        worker.handle_result(&key, Err(unavailable())).await;
        assert_eq!(controller.queue().num_requeues(&key).await, 0);
    }

    #[tokio::test]
    async fn test_success_forgets_requeues() {
        let controller = controller();
        let worker = controller.worker(0);
        let key = "keel-system/orphan-1".to_string();

        worker.handle_result(&key, Err(unavailable())).await;
        assert_eq!(controller.queue().num_requeues(&key).await, 1);

        worker.handle_result(&key, Ok(ReconcileOutcome::Unchanged)).await;
        assert_eq!(controller.queue().num_requeues(&key).await, 0);
    }

    #[tokio::test]
    async fn test_malformed_key_is_dropped_without_retry() {
        let controller = controller();
        controller.queue().add("a/b/c".to_string()).await;

        assert!(controller.process_next_work_item().await);
        assert_eq!(controller.queue().num_requeues(&"a/b/c".to_string()).await, 0);

        // A rate-limited requeue would be back well within this window.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_fatal_cleanup_error_is_dropped_without_retry() {
        let controller = controller();
        let worker = controller.worker(0);
        let key = "keel-system/orphan-1".to_string();

        let err = ControllerError::Cleanup {
            name: "orphan-1".to_string(),
            source: CleanupError::UnknownOrphanType("orphan-1".to_string()),
        };
        worker.handle_result(&key, Err(err)).await;

        assert_eq!(controller.queue().num_requeues(&key).await, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.queue().is_empty().await);
    }
}
