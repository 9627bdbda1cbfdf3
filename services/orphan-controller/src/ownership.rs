//! Ownership arbitration between controller instances.
//!
//! Every node runs a controller. An orphan is handled by the controller on
//! its pinned node (the preferred owner) while that node is available, by
//! its current owner while the preferred owner is unavailable, and by anyone
//! once both are unavailable. Claims are optimistic status writes; losing a
//! race is not an error.

use keel_types::Orphan;
use tracing::{info, warn};

use crate::store::{DataStore, StoreError};

/// Responsibility rule over already-known availability.
///
/// `unavailable` is only consulted when the answer depends on it. An empty
/// id is always unavailable.
pub fn decide_responsibility(
    controller_id: &str,
    preferred_owner: &str,
    current_owner: &str,
    mut unavailable: impl FnMut(&str) -> bool,
) -> bool {
    if controller_id == preferred_owner {
        return true;
    }

    let mut is_unavailable = |id: &str| id.is_empty() || unavailable(id);

    if !is_unavailable(preferred_owner) {
        return false;
    }
    current_owner == controller_id || is_unavailable(current_owner)
}

/// Returns true if this controller should reconcile the orphan.
///
/// Availability lookup errors count as available, so a flaky store never
/// moves ownership.
pub async fn is_responsible(store: &dyn DataStore, controller_id: &str, orphan: &Orphan) -> bool {
    let preferred_owner = orphan.spec.node_id.as_str();
    let current_owner = orphan.status.owner_id.as_str();

    if controller_id == preferred_owner {
        return true;
    }

    let preferred_down = owner_unavailable(store, preferred_owner).await;
    // Only matters once the preferred owner is down.
    let current_down = preferred_down && owner_unavailable(store, current_owner).await;

    decide_responsibility(controller_id, preferred_owner, current_owner, |id| {
        if id == preferred_owner {
            preferred_down
        } else {
            current_down
        }
    })
}

async fn owner_unavailable(store: &dyn DataStore, node_id: &str) -> bool {
    if node_id.is_empty() {
        return true;
    }
    match crate::conditions::node_unavailable(store, node_id).await {
        Ok(unavailable) => unavailable,
        Err(e) => {
            warn!(node_id = %node_id, error = %e, "Failed to check node availability, assuming available");
            false
        }
    }
}

/// Result of an ownership claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This controller owns the orphan; carries the latest stored copy.
    Claimed(Orphan),

    /// Another writer updated the orphan first.
    LostRace,
}

/// Record this controller as the orphan's owner if it is not already.
pub async fn claim(
    store: &dyn DataStore,
    controller_id: &str,
    mut orphan: Orphan,
) -> Result<ClaimOutcome, StoreError> {
    if orphan.status.owner_id == controller_id {
        return Ok(ClaimOutcome::Claimed(orphan));
    }

    let previous = std::mem::replace(&mut orphan.status.owner_id, controller_id.to_string());
    match store.update_orphan_status(&orphan).await {
        Ok(updated) => {
            info!(
                orphan = %updated.metadata.key(),
                owner_id = %controller_id,
                previous_owner = %previous,
                "Orphan got new owner"
            );
            Ok(ClaimOutcome::Claimed(updated))
        }
        Err(e) if e.is_conflict() => Ok(ClaimOutcome::LostRace),
        Err(e) => Err(e),
    }
}
