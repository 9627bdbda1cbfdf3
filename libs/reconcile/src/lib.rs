//! Reconciliation loop primitives.
//!
//! This library provides the plumbing shared by keel controllers:
//!
//! - **Work queue**: deduplicating, rate-limited queue of resource keys
//!   ([`WorkQueue`]).
//! - **Backoff**: exponential per-key delays ([`BackoffPolicy`]).
//! - **Retry policy**: how many rate-limited requeues a key gets before it is
//!   dropped ([`RetryPolicy`]).
//! - **Error taxonomy**: how a failed pass is treated ([`ErrorKind`]).
//!
//! # Invariants
//!
//! - The same key is never held by two workers at once
//! - Reconcile passes are idempotent; requeueing is always safe
//! - Retries are bounded per key

pub mod backoff;
pub mod queue;

use std::time::Duration;

pub use backoff::BackoffPolicy;
pub use queue::{QueueKey, WorkQueue};

/// How a reconcile error should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Target already gone. Callers normally map this to success before it
    /// reaches the queue.
    NotFound,

    /// Optimistic-concurrency conflict; another writer got there first.
    Conflict,

    /// Infrastructure failure that may resolve on its own.
    Transient,

    /// Cannot succeed without a change to the resource itself.
    Fatal,
}

/// Classification hook for controller error types.
pub trait Classify {
    /// Kind of this error.
    fn kind(&self) -> ErrorKind;

    /// Returns true for optimistic-concurrency conflicts.
    fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// Outcome of a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue with backoff.
    Requeue,

    /// Retries exhausted; drop the key from the queue.
    Drop,
}

/// Bounded retry policy for failed keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum rate-limited requeues per key.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Decide what to do with a key that has already been requeued
    /// `requeues` times.
    pub fn decide(&self, requeues: u32) -> RetryDecision {
        if requeues < self.max_retries {
            RetryDecision::Requeue
        } else {
            RetryDecision::Drop
        }
    }
}

/// Default retry limit per key.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default number of workers per controller.
pub const DEFAULT_WORKERS: usize = 4;

/// Default base delay for rate-limited requeues.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Default cap for rate-limited requeues.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(1000);
