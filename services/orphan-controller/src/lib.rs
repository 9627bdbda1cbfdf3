//! keel orphan controller library.
//!
//! Reconciles orphaned replica data: data left on a node's disks that no
//! live replica references. The crate ships an `orphan-controller` binary and
//! exposes the library surface for integration testing.
//!
//! ## Architecture
//!
//! ```text
//!  store watch ──► EventBridge ──► WorkQueue ──► workers ──► OrphanReconciler
//!       ▲                                                      │
//!       │                  ┌────────────┬──────────────────────┤
//!       │                  ▼            ▼                      ▼
//!       │              ownership    conditions          CleanupExecutor
//!       │                  │            │               (fs / disk service)
//!       └──── status, finalizer writes ─┘
//! ```
//!
//! - **Ownership**: the controller on the orphan's node handles it; others
//!   take over only while that node is unavailable.
//! - **Conditions**: `DataCleanable` gates physical deletion; `Error`
//!   records the last cleanup failure.
//! - **Cleanup**: runs when the orphan is pending deletion; the finalizer is
//!   removed only after cleanup succeeds.

pub mod cleanup;
pub mod conditions;
pub mod config;
pub mod disk_service;
pub mod error;
pub mod events;
pub mod ownership;
pub mod reconciler;
pub mod store;
pub mod worker;

pub use config::{Config, ControllerConfig};
pub use error::ControllerError;
pub use worker::OrphanController;
