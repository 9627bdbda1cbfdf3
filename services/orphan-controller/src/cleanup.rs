//! Physical cleanup of orphaned data.
//!
//! Cleanup is gated twice before anything is touched: the orphan must be
//! pinned to this controller's node, and `DataCleanable` must be exactly
//! `True`. Either gate failing is a successful no-op so the record can still
//! be finalized. Parameters that cannot be interpreted are an error; cleanup
//! never guesses a location.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_reconcile::{Classify, ErrorKind};
use keel_types::{
    ConditionType, DataEngine, DiskType, Orphan, OrphanType, ParameterError, ReplicaData,
    REPLICA_DIRECTORY,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::disk_service::{DeleteReplicaInstance, DiskServiceConnector, DiskServiceError};
use crate::store::{DataStore, StoreError};

/// What a cleanup call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Orphan belongs to another node; nothing touched.
    SkippedForeignNode,
    /// `DataCleanable` is not `True`; data left in place.
    SkippedNotCleanable,
    /// Data deleted.
    Deleted,
    /// Data was already gone.
    AlreadyAbsent,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("unknown orphan type for orphan {0}")]
    UnknownOrphanType(String),

    #[error("invalid parameters: {0}")]
    Parameters(#[from] ParameterError),

    #[error("failed to delete {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no running {engine:?} instance manager on node {node_id}")]
    NoRunningManager { node_id: String, engine: DataEngine },

    #[error("cannot delete replica instance {name}: {source}")]
    DiskService {
        name: String,
        #[source]
        source: DiskServiceError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for CleanupError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownOrphanType(_) | Self::Parameters(_) => ErrorKind::Fatal,
            Self::Filesystem { .. } | Self::NoRunningManager { .. } => ErrorKind::Transient,
            Self::DiskService { source, .. } => source.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

/// Deletes orphaned data owned by this controller's node.
pub struct CleanupExecutor {
    controller_id: String,
    store: Arc<dyn DataStore>,
    disk_service: Arc<dyn DiskServiceConnector>,
}

impl CleanupExecutor {
    pub fn new(
        controller_id: impl Into<String>,
        store: Arc<dyn DataStore>,
        disk_service: Arc<dyn DiskServiceConnector>,
    ) -> Self {
        Self {
            controller_id: controller_id.into(),
            store,
            disk_service,
        }
    }

    /// Delete the orphan's data if it is safe to do so.
    pub async fn cleanup_data(&self, orphan: &Orphan) -> Result<CleanupOutcome, CleanupError> {
        if orphan.spec.node_id != self.controller_id {
            info!(
                orphan = %orphan.name(),
                node_id = %orphan.spec.node_id,
                controller_id = %self.controller_id,
                "Orphan is on another node, only removing the record"
            );
            return Ok(CleanupOutcome::SkippedForeignNode);
        }

        if !orphan.status.conditions.is_true(ConditionType::DataCleanable) {
            info!(orphan = %orphan.name(), "Data is not cleanable, only removing the record");
            return Ok(CleanupOutcome::SkippedNotCleanable);
        }

        match orphan.spec.orphan_type {
            OrphanType::Replica => {
                let data = ReplicaData::from_orphan(orphan)?;
                self.delete_replica_data(&data).await
            }
            OrphanType::Unknown => Err(CleanupError::UnknownOrphanType(orphan.name().to_string())),
        }
    }

    async fn delete_replica_data(&self, data: &ReplicaData) -> Result<CleanupOutcome, CleanupError> {
        debug!(
            disk_type = %data.disk_type(),
            data_name = %data.data_name(),
            "Deleting orphaned replica data"
        );
        match data {
            ReplicaData::Filesystem {
                disk_path,
                data_name,
            } => {
                let path = Path::new(disk_path).join(REPLICA_DIRECTORY).join(data_name);
                info!(path = %path.display(), "Deleting orphaned replica directory");
                delete_path(&path).await
            }
            ReplicaData::Block {
                disk_name,
                disk_uuid,
                data_name,
            } => {
                let request = DeleteReplicaInstance {
                    disk_type: DiskType::Block,
                    disk_name: disk_name.clone(),
                    disk_uuid: disk_uuid.clone(),
                    disk_driver: String::new(),
                    replica_instance_name: data_name.clone(),
                };
                self.delete_replica_instance(&request).await
            }
        }
    }

    async fn delete_replica_instance(
        &self,
        request: &DeleteReplicaInstance,
    ) -> Result<CleanupOutcome, CleanupError> {
        info!(
            replica_instance = %request.replica_instance_name,
            disk_uuid = %request.disk_uuid,
            node_id = %self.controller_id,
            "Deleting orphaned replica instance"
        );

        let managers = self
            .store
            .list_instance_managers_by_node(&self.controller_id)
            .await?;
        let manager = managers
            .iter()
            .find(|im| im.data_engine == DataEngine::V2 && im.is_running())
            .ok_or_else(|| CleanupError::NoRunningManager {
                node_id: self.controller_id.clone(),
                engine: DataEngine::V2,
            })?;

        let disk_service_error = |source| CleanupError::DiskService {
            name: request.replica_instance_name.clone(),
            source,
        };

        let mut client = self
            .disk_service
            .connect(manager)
            .await
            .map_err(disk_service_error)?;

        match client.delete_replica_instance(request).await {
            Ok(()) => Ok(CleanupOutcome::Deleted),
            Err(e) if e.is_not_found() => {
                debug!(replica_instance = %request.replica_instance_name, "Replica instance already gone");
                Ok(CleanupOutcome::AlreadyAbsent)
            }
            Err(e) => Err(disk_service_error(e)),
        }
    }
}

/// Remove a file or directory tree. Absent paths are success.
async fn delete_path(path: &Path) -> Result<CleanupOutcome, CleanupError> {
    let filesystem_error = |source| CleanupError::Filesystem {
        path: path.to_path_buf(),
        source,
    };

    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CleanupOutcome::AlreadyAbsent),
        Err(e) => return Err(filesystem_error(e)),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(CleanupOutcome::Deleted),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CleanupOutcome::AlreadyAbsent),
        Err(e) => Err(filesystem_error(e)),
    }
}
