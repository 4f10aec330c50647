//! Error types and retry machinery for the PostgresUserRole controller
//!
//! Besides the error enum itself this module carries the requeue
//! schedule. kube-rs does not rate-limit requeues the way
//! controller-runtime's workqueue does, so consecutive failures per
//! object are counted here and fed into the delay computation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::postgres::PgError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
/// This is idiomatic for error enums and improves readability at call sites.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Engine error: {0}")]
    EngineError(#[from] PgError),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Rotation halted: {0}")]
    RotationHaltedError(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Reconcile deadline exceeded after {0:?}")]
    DeadlineError(Duration),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            // Kubernetes API errors are often retryable
            Error::KubeError(e) => {
                match e {
                    kube::Error::Api(api_err) => {
                        // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                        let code = api_err.code;
                        if (400..500).contains(&code) {
                            return code == 409 || code == 429;
                        }
                        // 5xx errors are retryable
                        true
                    }
                    // Network and other errors are retryable
                    _ => true,
                }
            }
            // Connection loss converges on retry; rejected statements do not
            Error::EngineError(e) => e.is_transient(),
            // Validation errors are permanent until the spec changes
            Error::ValidationError(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
            // Collaborators might appear later
            Error::NotFound(_) => true,
            // Drains once the reaper drops the queued role
            Error::RotationHaltedError(_) => true,
            Error::FinalizerError(_) => true,
            Error::DeadlineError(_) => true,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Requeue schedule for failed passes.
///
/// Retryable failures start at `base` and double per consecutive failure
/// of the same object, capped at `ceiling`; a jitter fraction spreads
/// requeues of objects that failed together. A permanent failure sits at
/// the ceiling straight away, since only a spec change can fix it.
#[derive(Clone, Debug)]
pub struct BackoffSchedule {
    pub base: Duration,
    pub ceiling: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            ceiling: Duration::from_secs(300),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffSchedule {
    /// Delay before the next pass, given how many consecutive failures
    /// the object has accumulated (0 for the first failure)
    pub fn delay(&self, error: &Error, attempt: u32) -> Duration {
        if !error.is_retryable() {
            return self.ceiling;
        }

        // Exponent is clamped so powi cannot blow up on a long streak
        let raw = self.base.as_secs_f64() * self.factor.powi(attempt.min(16) as i32);
        let spread = 1.0 + self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
        let delayed = (raw * spread).min(self.ceiling.as_secs_f64());

        Duration::from_secs_f64(delayed.max(0.0))
    }
}

/// Consecutive-failure counter per object.
///
/// The count backs [`BackoffSchedule::delay`] and is dropped again on the
/// first successful pass. Cloning shares the underlying map, so the
/// controller callbacks and the reconciler see the same counts.
#[derive(Clone, Default)]
pub struct FailureTracker {
    counts: Arc<Mutex<HashMap<String, u32>>>,
}

impl FailureTracker {
    /// Count a failed pass and return which attempt it was, starting at 0
    pub fn record(&self, key: &str) -> u32 {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = counts.entry(key.to_string()).or_default();
        let attempt = *slot;
        *slot = slot.saturating_add(1);

        attempt
    }

    /// Forget the failure history after a successful pass
    pub fn reset(&self, key: &str) {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_tracker_counts_per_key() {
        let tracker = FailureTracker::default();

        assert_eq!(tracker.record("a"), 0);
        assert_eq!(tracker.record("a"), 1);
        assert_eq!(tracker.record("a"), 2);
        // Other objects have their own streak
        assert_eq!(tracker.record("b"), 0);
    }

    #[test]
    fn test_failure_tracker_reset_clears_the_streak() {
        let tracker = FailureTracker::default();
        tracker.record("a");
        tracker.record("a");

        tracker.reset("a");
        assert_eq!(tracker.record("a"), 0);
    }

    #[test]
    fn test_failure_tracker_clones_share_counts() {
        let tracker = FailureTracker::default();
        let shared = tracker.clone();

        assert_eq!(tracker.record("a"), 0);
        assert_eq!(shared.record("a"), 1);
    }

    #[test]
    fn test_schedule_escalates_for_retryable_errors() {
        let schedule = BackoffSchedule::default();
        let error = Error::NotFound("PostgresDatabase default/orders".to_string());

        let first = schedule.delay(&error, 0).as_secs_f64();
        assert!((4.0..6.0).contains(&first), "first delay was {first}");

        let fifth = schedule.delay(&error, 4).as_secs_f64();
        assert!((70.0..90.0).contains(&fifth), "fifth delay was {fifth}");
    }

    #[test]
    fn test_schedule_caps_at_the_ceiling() {
        let schedule = BackoffSchedule::default();
        let error = Error::NotFound("gone".to_string());

        let delay = schedule.delay(&error, 30);
        assert!(delay <= schedule.ceiling);
    }

    #[test]
    fn test_permanent_errors_wait_the_full_ceiling() {
        let schedule = BackoffSchedule::default();
        let error = Error::ValidationError("duplicate database".to_string());

        assert_eq!(schedule.delay(&error, 0), schedule.ceiling);
        assert_eq!(schedule.delay(&error, 7), schedule.ceiling);
    }
}
