//! Orphan resources: on-disk data that no live replica references.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::condition::Conditions;
use crate::error::ParameterError;
use crate::meta::ObjectMeta;

/// Parameter keys recognized on `Replica` orphans.
pub mod params {
    pub const DISK_TYPE: &str = "DiskType";
    pub const DISK_NAME: &str = "DiskName";
    pub const DISK_UUID: &str = "DiskUUID";
    pub const DISK_PATH: &str = "DiskPath";
    pub const DATA_NAME: &str = "DataName";
}

/// Subdirectory of a filesystem disk holding replica data.
pub const REPLICA_DIRECTORY: &str = "replicas";

/// An orphan resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Orphan {
    pub metadata: ObjectMeta,
    pub spec: OrphanSpec,
    #[serde(default)]
    pub status: OrphanStatus,
}

impl Orphan {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Look up a spec parameter, treating empty values as absent.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.spec
            .parameters
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Orphan spec; immutable by convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanSpec {
    /// Node holding the orphaned data.
    #[serde(rename = "nodeID")]
    pub node_id: String,

    #[serde(rename = "type")]
    pub orphan_type: OrphanType,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Kind of orphaned data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanType {
    Replica,

    /// Any type this build does not recognize. Never cleaned.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for OrphanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replica => f.write_str("replica"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Orphan status; written by the owning controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanStatus {
    #[serde(rename = "ownerID", default)]
    pub owner_id: String,

    #[serde(default)]
    pub conditions: Conditions,
}

/// Storage backend of a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Filesystem,
    Block,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskType {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filesystem" => Ok(Self::Filesystem),
            "block" => Ok(Self::Block),
            other => Err(ParameterError::UnknownDiskType(other.to_string())),
        }
    }
}

/// Location of orphaned replica data, by backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaData {
    /// Replica directory under `<disk_path>/replicas/`.
    Filesystem { disk_path: String, data_name: String },

    /// Replica instance on a block disk managed by the disk service.
    Block {
        disk_name: String,
        disk_uuid: String,
        data_name: String,
    },
}

impl ReplicaData {
    /// Interpret replica orphan parameters.
    pub fn from_orphan(orphan: &Orphan) -> Result<Self, ParameterError> {
        let required = |key: &'static str| -> Result<String, ParameterError> {
            orphan
                .parameter(key)
                .map(str::to_string)
                .ok_or(ParameterError::Missing(key))
        };

        let disk_type: DiskType = required(params::DISK_TYPE)?.parse()?;
        let data_name = required(params::DATA_NAME)?;
        validate_data_name(&data_name)?;

        match disk_type {
            DiskType::Filesystem => {
                let disk_path = required(params::DISK_PATH)?;
                if !disk_path.starts_with('/') {
                    return Err(ParameterError::RelativeDiskPath(disk_path));
                }
                Ok(Self::Filesystem {
                    disk_path,
                    data_name,
                })
            }
            DiskType::Block => Ok(Self::Block {
                disk_name: required(params::DISK_NAME)?,
                disk_uuid: required(params::DISK_UUID)?,
                data_name,
            }),
        }
    }

    pub fn disk_type(&self) -> DiskType {
        match self {
            Self::Filesystem { .. } => DiskType::Filesystem,
            Self::Block { .. } => DiskType::Block,
        }
    }

    pub fn data_name(&self) -> &str {
        match self {
            Self::Filesystem { data_name, .. } | Self::Block { data_name, .. } => data_name,
        }
    }
}

/// A data name must be a single path component.
fn validate_data_name(name: &str) -> Result<(), ParameterError> {
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(ParameterError::UnsafeDataName(name.to_string()));
    }
    Ok(())
}
