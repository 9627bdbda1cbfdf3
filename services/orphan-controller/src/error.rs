//! Controller error types.

use keel_reconcile::{Classify, ErrorKind};
use keel_types::KeyError;
use thiserror::Error;

use crate::cleanup::CleanupError;
use crate::store::StoreError;

/// Errors from a reconcile pass.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to delete orphan {name} data: {source}")]
    Cleanup {
        name: String,
        #[source]
        source: CleanupError,
    },

    #[error(transparent)]
    InvalidKey(#[from] KeyError),
}

impl Classify for ControllerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Cleanup { source, .. } => source.kind(),
            Self::InvalidKey(_) => ErrorKind::Fatal,
        }
    }
}
