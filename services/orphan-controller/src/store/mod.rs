//! Resource store interface.
//!
//! The store is external to the controller: a watchable, versioned key-value
//! store with optimistic-concurrency writes. The controller only sees it
//! through [`DataStore`] and [`EventSource`]. [`MemoryStore`] implements the
//! same contract in-process.
//!
//! Contract:
//! - Every write bumps the object's resource version.
//! - Writes carrying a stale resource version fail with
//!   [`StoreError::Conflict`].
//! - A resource with a deletion timestamp is only erased once its finalizer
//!   list is empty.

mod memory;

use async_trait::async_trait;
use keel_reconcile::{Classify, ErrorKind};
use keel_types::{InstanceManager, Node, Orphan, ResourceKey};
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::{MemoryStore, Seed};

/// Errors from store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Optimistic-concurrency conflict.
    #[error("conflict writing {kind} {name}: resource version {expected} is stale (current {actual})")]
    Conflict {
        kind: &'static str,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::AlreadyExists { .. } | Self::Unavailable(_) => ErrorKind::Transient,
        }
    }
}

/// A change observed on a watched resource type.
///
/// `Deleted` carries the last known state of the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// The object this event refers to.
    pub fn object(&self) -> &T {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => obj,
        }
    }
}

/// Change feed for one resource type, with a full listing for initial sync.
#[async_trait]
pub trait EventSource<T>: Send + Sync
where
    T: Clone + Send + 'static,
{
    /// Subscribe to future changes.
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<T>>;

    /// List every object currently stored.
    async fn list(&self) -> Result<Vec<T>, StoreError>;
}

/// Reads and writes the orphan controller needs from the store.
#[async_trait]
pub trait DataStore:
    EventSource<Orphan> + EventSource<Node> + EventSource<InstanceManager> + Send + Sync
{
    /// Get an orphan by key.
    async fn get_orphan(&self, key: &ResourceKey) -> Result<Orphan, StoreError>;

    /// List orphans pinned to a node.
    async fn list_orphans_by_node(&self, node_id: &str) -> Result<Vec<Orphan>, StoreError>;

    /// Replace an orphan's status. Fails with a conflict if the orphan's
    /// resource version is stale. Returns the stored object.
    async fn update_orphan_status(&self, orphan: &Orphan) -> Result<Orphan, StoreError>;

    /// Remove this controller's finalizer from an orphan. Erases the orphan
    /// when it is pending deletion and no finalizers remain.
    async fn remove_orphan_finalizer(&self, orphan: &Orphan) -> Result<(), StoreError>;

    /// Get a node by name.
    async fn get_node(&self, name: &str) -> Result<Node, StoreError>;

    /// List instance managers running on a node.
    async fn list_instance_managers_by_node(
        &self,
        node_id: &str,
    ) -> Result<Vec<InstanceManager>, StoreError>;
}
