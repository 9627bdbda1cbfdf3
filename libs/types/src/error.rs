//! Error types for resource parsing.

use thiserror::Error;

/// Errors parsing a `namespace/name` key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

/// Errors interpreting orphan parameters.
///
/// All of these are fatal for cleanup: the data location cannot be proven,
/// so nothing is deleted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParameterError {
    /// A required parameter is absent or empty.
    #[error("missing parameter {0}")]
    Missing(&'static str),

    /// The disk type is not one this controller knows how to clean.
    #[error("unknown disk type {0:?}")]
    UnknownDiskType(String),

    /// Filesystem disk paths must be absolute.
    #[error("disk path {0:?} is not absolute")]
    RelativeDiskPath(String),

    /// The data name would escape the replicas directory.
    #[error("unsafe data name {0:?}")]
    UnsafeDataName(String),
}
