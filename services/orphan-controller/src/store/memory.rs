//! In-memory store.
//!
//! Honors the same contract as the cluster store: a global, strictly
//! increasing resource version; conflicts on stale writes; finalizer-gated
//! erasure; a broadcast watch feed per resource type. Used by tests and by
//! the binary for local runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use keel_types::{InstanceManager, Lifecycle, Node, Orphan, ResourceKey, FINALIZER};
use serde::Deserialize;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{DataStore, EventSource, StoreError, WatchEvent};

/// Capacity of each watch channel. Slow subscribers past this lag and
/// must resync.
const WATCH_CAPACITY: usize = 1024;

/// Initial contents for a [`MemoryStore`], as loaded from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub orphans: Vec<Orphan>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub instance_managers: Vec<InstanceManager>,
}

#[derive(Default)]
struct State {
    version: u64,
    orphans: BTreeMap<ResourceKey, Orphan>,
    nodes: BTreeMap<String, Node>,
    instance_managers: BTreeMap<String, InstanceManager>,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Process-local implementation of [`DataStore`].
pub struct MemoryStore {
    state: RwLock<State>,
    orphan_events: broadcast::Sender<WatchEvent<Orphan>>,
    node_events: broadcast::Sender<WatchEvent<Node>>,
    instance_manager_events: broadcast::Sender<WatchEvent<InstanceManager>>,
    unavailable: AtomicBool,
    orphan_writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (orphan_events, _) = broadcast::channel(WATCH_CAPACITY);
        let (node_events, _) = broadcast::channel(WATCH_CAPACITY);
        let (instance_manager_events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            orphan_events,
            node_events,
            instance_manager_events,
            unavailable: AtomicBool::new(false),
            orphan_writes: AtomicU64::new(0),
        }
    }

    /// Build a store pre-populated from a seed.
    pub async fn from_seed(seed: Seed) -> Result<Self, StoreError> {
        let store = Self::new();
        for node in seed.nodes {
            store.put_node(node).await?;
        }
        for im in seed.instance_managers {
            store.put_instance_manager(im).await?;
        }
        for orphan in seed.orphans {
            store.create_orphan(orphan).await?;
        }
        Ok(store)
    }

    /// Make every store call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Successful orphan writes made through [`DataStore`] so far.
    pub fn orphan_writes(&self) -> u64 {
        self.orphan_writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    /// Create an orphan. The controller finalizer is attached on creation.
    pub async fn create_orphan(&self, mut orphan: Orphan) -> Result<Orphan, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let key = orphan.metadata.key();
        if state.orphans.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: "orphan",
                name: key.to_string(),
            });
        }

        if !orphan.metadata.has_finalizer(FINALIZER) {
            orphan.metadata.finalizers.push(FINALIZER.to_string());
        }
        orphan.metadata.deletion_timestamp = None;
        orphan.metadata.resource_version = state.next_version();
        state.orphans.insert(key, orphan.clone());
        drop(state);

        let _ = self.orphan_events.send(WatchEvent::Added(orphan.clone()));
        Ok(orphan)
    }

    /// Request deletion of an orphan.
    ///
    /// With finalizers present the orphan only gets a deletion timestamp;
    /// without any it is erased immediately.
    pub async fn request_orphan_deletion(&self, key: &ResourceKey) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let version = state.next_version();
        let Some(orphan) = state.orphans.get_mut(key) else {
            return Err(not_found("orphan", key));
        };

        if orphan.metadata.lifecycle() == Lifecycle::PendingDeletion {
            return Ok(());
        }
        orphan.metadata.deletion_timestamp = Some(Utc::now());

        if orphan.metadata.lifecycle() == Lifecycle::Erased {
            let erased = state.orphans.remove(key);
            drop(state);
            if let Some(erased) = erased {
                let _ = self.orphan_events.send(WatchEvent::Deleted(erased));
            }
            return Ok(());
        }

        orphan.metadata.resource_version = version;
        let snapshot = orphan.clone();
        drop(state);

        let _ = self.orphan_events.send(WatchEvent::Modified(snapshot));
        Ok(())
    }

    /// Create or replace a node.
    pub async fn put_node(&self, mut node: Node) -> Result<Node, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        node.metadata.resource_version = state.next_version();
        let previous = state
            .nodes
            .insert(node.metadata.name.clone(), node.clone());
        drop(state);

        let event = match previous {
            Some(_) => WatchEvent::Modified(node.clone()),
            None => WatchEvent::Added(node.clone()),
        };
        let _ = self.node_events.send(event);
        Ok(node)
    }

    pub async fn delete_node(&self, name: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let removed = self.state.write().await.nodes.remove(name);
        let node = removed.ok_or_else(|| not_found("node", name))?;
        let _ = self.node_events.send(WatchEvent::Deleted(node));
        Ok(())
    }

    /// Create or replace an instance manager.
    pub async fn put_instance_manager(
        &self,
        mut im: InstanceManager,
    ) -> Result<InstanceManager, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        im.metadata.resource_version = state.next_version();
        let previous = state
            .instance_managers
            .insert(im.metadata.name.clone(), im.clone());
        drop(state);

        let event = match previous {
            Some(_) => WatchEvent::Modified(im.clone()),
            None => WatchEvent::Added(im.clone()),
        };
        let _ = self.instance_manager_events.send(event);
        Ok(im)
    }

    pub async fn delete_instance_manager(&self, name: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let removed = self.state.write().await.instance_managers.remove(name);
        let im = removed.ok_or_else(|| not_found("instance manager", name))?;
        let _ = self.instance_manager_events.send(WatchEvent::Deleted(im));
        Ok(())
    }
}

fn not_found(kind: &'static str, name: impl ToString) -> StoreError {
    StoreError::NotFound {
        kind,
        name: name.to_string(),
    }
}

fn check_version(
    kind: &'static str,
    key: &ResourceKey,
    expected: u64,
    actual: u64,
) -> Result<(), StoreError> {
    if expected != actual {
        return Err(StoreError::Conflict {
            kind,
            name: key.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[async_trait]
impl EventSource<Orphan> for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<Orphan>> {
        self.orphan_events.subscribe()
    }

    async fn list(&self) -> Result<Vec<Orphan>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.orphans.values().cloned().collect())
    }
}

#[async_trait]
impl EventSource<Node> for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<Node>> {
        self.node_events.subscribe()
    }

    async fn list(&self) -> Result<Vec<Node>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }
}

#[async_trait]
impl EventSource<InstanceManager> for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<InstanceManager>> {
        self.instance_manager_events.subscribe()
    }

    async fn list(&self) -> Result<Vec<InstanceManager>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .instance_managers
            .values()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get_orphan(&self, key: &ResourceKey) -> Result<Orphan, StoreError> {
        self.check_available()?;
        self.state
            .read()
            .await
            .orphans
            .get(key)
            .cloned()
            .ok_or_else(|| not_found("orphan", key))
    }

    async fn list_orphans_by_node(&self, node_id: &str) -> Result<Vec<Orphan>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .orphans
            .values()
            .filter(|o| o.spec.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn update_orphan_status(&self, orphan: &Orphan) -> Result<Orphan, StoreError> {
        self.check_available()?;
        let key = orphan.metadata.key();
        let mut state = self.state.write().await;
        let version = state.next_version();
        let stored = state
            .orphans
            .get_mut(&key)
            .ok_or_else(|| not_found("orphan", &key))?;
        check_version(
            "orphan",
            &key,
            orphan.metadata.resource_version,
            stored.metadata.resource_version,
        )?;

        stored.status = orphan.status.clone();
        stored.metadata.resource_version = version;
        let snapshot = stored.clone();
        drop(state);

        self.orphan_writes.fetch_add(1, Ordering::SeqCst);
        debug!(orphan = %key, resource_version = version, "Orphan status updated");
        let _ = self.orphan_events.send(WatchEvent::Modified(snapshot.clone()));
        Ok(snapshot)
    }

    async fn remove_orphan_finalizer(&self, orphan: &Orphan) -> Result<(), StoreError> {
        self.check_available()?;
        let key = orphan.metadata.key();
        let mut state = self.state.write().await;
        let version = state.next_version();
        let stored = state
            .orphans
            .get_mut(&key)
            .ok_or_else(|| not_found("orphan", &key))?;
        check_version(
            "orphan",
            &key,
            orphan.metadata.resource_version,
            stored.metadata.resource_version,
        )?;

        stored.metadata.finalizers.retain(|f| f != FINALIZER);
        stored.metadata.resource_version = version;

        let event = if stored.metadata.lifecycle() == Lifecycle::Erased {
            state.orphans.remove(&key).map(WatchEvent::Deleted)
        } else {
            Some(WatchEvent::Modified(stored.clone()))
        };
        drop(state);

        self.orphan_writes.fetch_add(1, Ordering::SeqCst);
        debug!(orphan = %key, "Orphan finalizer removed");
        if let Some(event) = event {
            let _ = self.orphan_events.send(event);
        }
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        self.check_available()?;
        self.state
            .read()
            .await
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("node", name))
    }

    async fn list_instance_managers_by_node(
        &self,
        node_id: &str,
    ) -> Result<Vec<InstanceManager>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .instance_managers
            .values()
            .filter(|im| im.node_id == node_id)
            .cloned()
            .collect())
    }
}
