//! Condition engine.
//!
//! `DataCleanable` is derived from the orphan and an observation of its
//! node. Deriving it is pure ([`evaluate`]); only the observation touches the
//! store ([`observe_node`]).

use std::fmt;

use keel_types::{params, ConditionStatus, ConditionType, Node, Orphan, OrphanType};

use crate::store::{DataStore, StoreError};

/// Why an orphan's data must not be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanableReason {
    /// Node missing, not ready, or without a running instance manager.
    NodeUnavailable,
    /// Node is being drained.
    NodeEvicted,
    /// No ready disk carries the orphan's disk UUID.
    DiskInvalid,
    /// The disk carrying the UUID has a different name or path now.
    DiskChanged,
    /// The disk is being drained.
    DiskEvicted,
}

impl CleanableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeUnavailable => "NodeUnavailable",
            Self::NodeEvicted => "NodeEvicted",
            Self::DiskInvalid => "DiskInvalid",
            Self::DiskChanged => "DiskChanged",
            Self::DiskEvicted => "DiskEvicted",
        }
    }
}

impl fmt::Display for CleanableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the controller currently knows about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeObservation {
    Unavailable,
    Available(Node),
}

/// Observe a node: present, ready, and with at least one running instance
/// manager, or unavailable.
pub async fn observe_node(
    store: &dyn DataStore,
    node_id: &str,
) -> Result<NodeObservation, StoreError> {
    if node_id.is_empty() {
        return Ok(NodeObservation::Unavailable);
    }

    let node = match store.get_node(node_id).await {
        Ok(node) => node,
        Err(e) if e.is_not_found() => return Ok(NodeObservation::Unavailable),
        Err(e) => return Err(e),
    };
    if !node.status.ready {
        return Ok(NodeObservation::Unavailable);
    }

    let managers = store.list_instance_managers_by_node(node_id).await?;
    if !managers.iter().any(|im| im.is_running()) {
        return Ok(NodeObservation::Unavailable);
    }

    Ok(NodeObservation::Available(node))
}

/// Returns true if the node is down, deleted, or missing its manager.
pub async fn node_unavailable(store: &dyn DataStore, node_id: &str) -> Result<bool, StoreError> {
    Ok(observe_node(store, node_id).await? == NodeObservation::Unavailable)
}

/// Derive the `DataCleanable` reason. `None` means cleanable.
pub fn evaluate(orphan: &Orphan, observation: &NodeObservation) -> Option<CleanableReason> {
    let node = match observation {
        NodeObservation::Unavailable => return Some(CleanableReason::NodeUnavailable),
        NodeObservation::Available(node) => node,
    };

    if node.spec.eviction_requested {
        return Some(CleanableReason::NodeEvicted);
    }

    match orphan.spec.orphan_type {
        OrphanType::Replica => replica_disk_reason(orphan, node),
        OrphanType::Unknown => None,
    }
}

fn replica_disk_reason(orphan: &Orphan, node: &Node) -> Option<CleanableReason> {
    let uuid = orphan.parameter(params::DISK_UUID).unwrap_or_default();
    let Some((disk_name, disk)) = node.ready_disk(uuid) else {
        return Some(CleanableReason::DiskInvalid);
    };

    let expected_name = orphan.parameter(params::DISK_NAME).unwrap_or_default();
    let expected_path = orphan.parameter(params::DISK_PATH).unwrap_or_default();
    if disk_name != expected_name || disk.path != expected_path {
        return Some(CleanableReason::DiskChanged);
    }

    if disk.eviction_requested {
        return Some(CleanableReason::DiskEvicted);
    }

    None
}

/// Write `DataCleanable` for the given observation and clear `Error`.
pub fn apply(orphan: &mut Orphan, observation: &NodeObservation) {
    let reason = evaluate(orphan, observation);
    let conditions = &mut orphan.status.conditions;

    match reason {
        Some(reason) => conditions.set(
            ConditionType::DataCleanable,
            ConditionStatus::False,
            reason.as_str(),
            "",
        ),
        None => conditions.set(ConditionType::DataCleanable, ConditionStatus::True, "", ""),
    }
    conditions.set(ConditionType::Error, ConditionStatus::False, "", "");
}

/// Recompute the orphan's conditions from live cluster state.
pub async fn update_conditions(store: &dyn DataStore, orphan: &mut Orphan) -> Result<(), StoreError> {
    let observation = observe_node(store, &orphan.spec.node_id).await?;
    apply(orphan, &observation);
    Ok(())
}
