use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flavor::FlavorId;
use crate::report::AttemptOutcome;

/// Unique identifier for a capacity lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    /// Create a new lease ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A temporary claim on one unit of a flavor's capacity.
///
/// Created by [`FlavorPool::acquire`](crate::pool::FlavorPool::acquire)
/// when a step is admitted, released when its attempt finishes for any
/// reason. A step never executes without holding a lease for its
/// declared flavor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub flavor: FlavorId,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(flavor: FlavorId) -> Self {
        Self {
            id: LeaseId::new(),
            flavor,
            acquired_at: Utc::now(),
        }
    }
}

/// Retry policy for step attempts.
///
/// `max_attempts` bounds the total number of attempt records a step may
/// accumulate; the default of 1 means no automatic retry.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u16,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u16) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

/// Whether an attempt outcome qualifies for another attempt at all.
///
/// Cancellation is terminal immediately; a pass is terminal trivially.
/// Failures, timeouts, and infrastructure faults are retried per policy.
pub fn outcome_retryable(outcome: &AttemptOutcome) -> bool {
    matches!(
        outcome,
        AttemptOutcome::Failed { .. } | AttemptOutcome::TimedOut | AttemptOutcome::ExecError { .. }
    )
}

/// Returns true when a step that has completed `attempts` attempts may
/// be retried under `policy`.
pub fn should_retry(attempts: u16, policy: &RetryPolicy) -> bool {
    attempts < policy.max_attempts
}
