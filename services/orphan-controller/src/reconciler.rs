//! Orphan reconcile pass.
//!
//! One pass for one key:
//!
//! ```text
//!   key ──► parse ──► namespace filter ──► fetch ──► responsible? ──► claim
//!                                                                      │
//!                    ┌─────────────────────────────────────────────────┤
//!                    ▼                                                 ▼
//!           pending deletion                                        active
//!     cleanup ─► remove finalizer                      recompute conditions ─► write on diff
//!        │ err
//!        └─► Error=True, write best-effort, return err
//! ```
//!
//! Every step is idempotent; a pass may be repeated at any time.

use std::sync::Arc;

use keel_reconcile::WorkQueue;
use keel_types::{ConditionStatus, ConditionType, Lifecycle, Orphan, ResourceKey};
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupExecutor, CleanupOutcome};
use crate::conditions;
use crate::error::ControllerError;
use crate::ownership::{self, ClaimOutcome};
use crate::store::DataStore;

/// What a successful pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Key belongs to another namespace.
    Ignored,
    /// Orphan no longer exists.
    NotFound,
    /// Another controller is responsible.
    NotResponsible,
    /// Another writer updated the orphan while claiming it.
    LostClaim,
    /// Cleanup ran and the finalizer was removed.
    Finalized(CleanupOutcome),
    /// Conditions changed and were written.
    StatusUpdated,
    /// Nothing to write.
    Unchanged,
    /// Status write conflicted; the key was queued again.
    Requeued,
}

/// Reconciles orphans for one controller instance.
pub struct OrphanReconciler {
    controller_id: String,
    namespace: String,
    store: Arc<dyn DataStore>,
    cleanup: CleanupExecutor,
    queue: WorkQueue<String>,
}

impl OrphanReconciler {
    pub fn new(
        controller_id: impl Into<String>,
        namespace: impl Into<String>,
        store: Arc<dyn DataStore>,
        cleanup: CleanupExecutor,
        queue: WorkQueue<String>,
    ) -> Self {
        Self {
            controller_id: controller_id.into(),
            namespace: namespace.into(),
            store,
            cleanup,
            queue,
        }
    }

    /// Run one reconcile pass for a `namespace/name` key.
    pub async fn sync(&self, key: &str) -> Result<ReconcileOutcome, ControllerError> {
        let key: ResourceKey = key.parse()?;
        if key.namespace != self.namespace {
            return Ok(ReconcileOutcome::Ignored);
        }

        let orphan = match self.store.get_orphan(&key).await {
            Ok(orphan) => orphan,
            Err(e) if e.is_not_found() => return Ok(ReconcileOutcome::NotFound),
            Err(e) => return Err(e.into()),
        };

        if !ownership::is_responsible(self.store.as_ref(), &self.controller_id, &orphan).await {
            return Ok(ReconcileOutcome::NotResponsible);
        }

        let orphan = match ownership::claim(self.store.as_ref(), &self.controller_id, orphan).await
        {
            Ok(ClaimOutcome::Claimed(orphan)) => orphan,
            Ok(ClaimOutcome::LostRace) => {
                debug!(orphan = %key, "Lost ownership claim race");
                return Ok(ReconcileOutcome::LostClaim);
            }
            Err(e) if e.is_not_found() => return Ok(ReconcileOutcome::NotFound),
            Err(e) => return Err(e.into()),
        };

        match orphan.metadata.lifecycle() {
            Lifecycle::PendingDeletion => self.finalize(&key, orphan).await,
            Lifecycle::Active => self.refresh_status(&key, orphan).await,
            // Deletion requested with no finalizers left; the store is dropping it.
            Lifecycle::Erased => Ok(ReconcileOutcome::NotFound),
        }
    }

    async fn finalize(
        &self,
        key: &ResourceKey,
        mut orphan: Orphan,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let cleanup = match self.cleanup.cleanup_data(&orphan).await {
            Ok(outcome) => outcome,
            Err(source) => {
                let err = ControllerError::Cleanup {
                    name: orphan.name().to_string(),
                    source,
                };
                self.record_error(key, &mut orphan, &err).await;
                return Err(err);
            }
        };

        match self.store.remove_orphan_finalizer(&orphan).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        info!(orphan = %key, outcome = ?cleanup, "Orphan finalized");
        Ok(ReconcileOutcome::Finalized(cleanup))
    }

    /// Persist `Error=True` for a failed cleanup. Write failures are logged,
    /// never returned; the cleanup error is what the caller reports.
    async fn record_error(&self, key: &ResourceKey, orphan: &mut Orphan, err: &ControllerError) {
        let existing = orphan.status.clone();
        orphan
            .status
            .conditions
            .set(ConditionType::Error, ConditionStatus::True, "", err.to_string());
        if orphan.status == existing {
            return;
        }

        if let Err(e) = self.store.update_orphan_status(orphan).await {
            warn!(orphan = %key, error = %e, "Failed to record cleanup error on orphan");
        }
    }

    async fn refresh_status(
        &self,
        key: &ResourceKey,
        mut orphan: Orphan,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let existing = orphan.status.clone();
        conditions::update_conditions(self.store.as_ref(), &mut orphan).await?;

        if orphan.status == existing {
            return Ok(ReconcileOutcome::Unchanged);
        }

        match self.store.update_orphan_status(&orphan).await {
            Ok(_) => {
                debug!(orphan = %key, "Orphan conditions updated");
                Ok(ReconcileOutcome::StatusUpdated)
            }
            Err(e) if e.is_conflict() => {
                debug!(orphan = %key, error = %e, "Requeue due to conflict");
                self.queue.add(key.to_string()).await;
                Ok(ReconcileOutcome::Requeued)
            }
            Err(e) if e.is_not_found() => Ok(ReconcileOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}
