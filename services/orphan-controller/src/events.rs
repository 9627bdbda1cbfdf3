//! Event bridge: store watch events to queue keys.
//!
//! - Orphan event: enqueue the orphan.
//! - Node event: enqueue every orphan pinned to that node.
//! - Instance manager event: enqueue every orphan on the manager's node.
//!
//! The bridge subscribes before its initial full sync so nothing falls
//! between the listing and the first event. A lagged receiver has lost
//! events; the bridge resyncs everything instead of guessing.

use std::sync::Arc;

use keel_reconcile::WorkQueue;
use keel_types::{InstanceManager, Node, Orphan};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::store::{DataStore, EventSource, StoreError, WatchEvent};

/// Feeds store changes into the orphan work queue.
pub struct EventBridge {
    store: Arc<dyn DataStore>,
    queue: WorkQueue<String>,
}

/// What to do after receiving from a watch stream.
enum Received<T> {
    Event(WatchEvent<T>),
    Lagged(u64),
    Closed,
}

fn received<T>(result: Result<WatchEvent<T>, RecvError>) -> Received<T> {
    match result {
        Ok(event) => Received::Event(event),
        Err(RecvError::Lagged(missed)) => Received::Lagged(missed),
        Err(RecvError::Closed) => Received::Closed,
    }
}

impl EventBridge {
    pub fn new(store: Arc<dyn DataStore>, queue: WorkQueue<String>) -> Self {
        Self { store, queue }
    }

    #[instrument(skip(self, shutdown), fields(queue = %self.queue.name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut orphans: broadcast::Receiver<WatchEvent<Orphan>> =
            EventSource::<Orphan>::subscribe(self.store.as_ref());
        let mut nodes: broadcast::Receiver<WatchEvent<Node>> =
            EventSource::<Node>::subscribe(self.store.as_ref());
        let mut managers: broadcast::Receiver<WatchEvent<InstanceManager>> =
            EventSource::<InstanceManager>::subscribe(self.store.as_ref());

        info!("Starting orphan event bridge");
        self.resync().await;

        loop {
            tokio::select! {
                result = orphans.recv() => match received(result) {
                    Received::Event(event) => self.enqueue_orphan(event.object()).await,
                    Received::Lagged(missed) => self.lagged("orphan", missed).await,
                    Received::Closed => break,
                },
                result = nodes.recv() => match received(result) {
                    Received::Event(event) => {
                        let node = event.object();
                        self.enqueue_orphans_on_node(node.name()).await;
                    }
                    Received::Lagged(missed) => self.lagged("node", missed).await,
                    Received::Closed => break,
                },
                result = managers.recv() => match received(result) {
                    Received::Event(event) => {
                        let im = event.object();
                        self.enqueue_orphans_on_node(&im.node_id).await;
                    }
                    Received::Lagged(missed) => self.lagged("instance manager", missed).await,
                    Received::Closed => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Orphan event bridge stopped");
    }

    async fn enqueue_orphan(&self, orphan: &Orphan) {
        self.queue.add(orphan.metadata.key().to_string()).await;
    }

    /// Enqueue every orphan pinned to a node.
    pub async fn enqueue_orphans_on_node(&self, node_id: &str) {
        if node_id.is_empty() {
            return;
        }
        match self.store.list_orphans_by_node(node_id).await {
            Ok(orphans) => {
                debug!(node_id = %node_id, count = orphans.len(), "Enqueue orphans on node");
                for orphan in &orphans {
                    self.enqueue_orphan(orphan).await;
                }
            }
            Err(e) => warn!(node_id = %node_id, error = %e, "Failed to list orphans on node"),
        }
    }

    /// Enqueue every orphan in the store.
    pub async fn resync(&self) {
        if let Err(e) = self.try_resync().await {
            warn!(error = %e, "Failed to list orphans for full sync");
        }
    }

    async fn try_resync(&self) -> Result<(), StoreError> {
        let orphans: Vec<Orphan> = EventSource::<Orphan>::list(self.store.as_ref()).await?;
        debug!(count = orphans.len(), "Full orphan sync");
        for orphan in &orphans {
            self.enqueue_orphan(orphan).await;
        }
        Ok(())
    }

    async fn lagged(&self, stream: &str, missed: u64) {
        warn!(stream = %stream, missed, "Watch stream lagged, resyncing all orphans");
        self.resync().await;
    }
}
