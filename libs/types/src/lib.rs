//! # keel-types
//!
//! Resource model shared by keel controllers.
//!
//! ## Resources
//!
//! - [`Orphan`]: replica data left on a disk with no live replica referencing it
//! - [`Node`]: a storage node and its disks
//! - [`InstanceManager`]: per-node process serving replica instances
//!
//! All resources carry [`ObjectMeta`] with a store-assigned resource version,
//! an optional deletion timestamp, and a finalizer list. A resource with a
//! deletion timestamp is [`Lifecycle::PendingDeletion`] until its finalizers
//! are removed, at which point the store erases it.

mod condition;
mod error;
mod meta;
mod node;
mod orphan;

pub use condition::{Condition, ConditionStatus, ConditionType, Conditions};
pub use error::{KeyError, ParameterError};
pub use meta::{Lifecycle, ObjectMeta, ResourceKey, FINALIZER};
pub use node::{
    DataEngine, DiskSpec, DiskStatus, InstanceManager, InstanceManagerState, Node, NodeSpec,
    NodeStatus,
};
pub use orphan::{
    params, DiskType, Orphan, OrphanSpec, OrphanStatus, OrphanType, ReplicaData,
    REPLICA_DIRECTORY,
};
