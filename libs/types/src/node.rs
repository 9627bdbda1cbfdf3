//! Nodes and the instance managers running on them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;
use crate::orphan::DiskType;

/// A storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Node-level drain flag.
    #[serde(default)]
    pub eviction_requested: bool,

    #[serde(default)]
    pub disks: BTreeMap<String, DiskSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    pub path: String,

    #[serde(default = "default_disk_type")]
    pub disk_type: DiskType,

    #[serde(default)]
    pub eviction_requested: bool,

    #[serde(rename = "diskUUID", default)]
    pub uuid: String,
}

fn default_disk_type() -> DiskType {
    DiskType::Filesystem
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node is up and reporting.
    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub disks: BTreeMap<String, DiskStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskStatus {
    #[serde(default)]
    pub ready: bool,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Find the ready disk carrying `uuid`, returning its name and spec.
    pub fn ready_disk(&self, uuid: &str) -> Option<(&str, &DiskSpec)> {
        if uuid.is_empty() {
            return None;
        }
        self.spec
            .disks
            .iter()
            .filter(|(_, disk)| disk.uuid == uuid)
            .find(|(name, _)| {
                self.status
                    .disks
                    .get(name.as_str())
                    .map(|s| s.ready)
                    .unwrap_or(false)
            })
            .map(|(name, disk)| (name.as_str(), disk))
    }
}

/// Per-node process hosting replica and engine instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceManager {
    pub metadata: ObjectMeta,

    #[serde(rename = "nodeID")]
    pub node_id: String,

    pub data_engine: DataEngine,

    pub state: InstanceManagerState,

    /// Address of the manager's services.
    #[serde(default)]
    pub ip: String,
}

impl InstanceManager {
    pub fn is_running(&self) -> bool {
        self.state == InstanceManagerState::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEngine {
    /// Filesystem-backed replicas.
    V1,
    /// Block-backed replicas served through the disk service.
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceManagerState {
    Starting,
    Running,
    Stopped,
    Error,
}
