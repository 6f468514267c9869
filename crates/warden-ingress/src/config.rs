//! Timing knobs for the reconcile driver

use std::time::Duration;

use warden_common::retry::RetryConfig;

/// Deadlines, requeue intervals, and retry budgets for ingress reconciliation
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileConfig {
    /// Upper bound for a single API call
    pub call_timeout: Duration,
    /// Upper bound for a whole reconcile pass; on expiry the pass is abandoned and requeued
    pub pass_deadline: Duration,
    /// Periodic resync once converged
    pub resync_interval: Duration,
    /// Requeue after a write, to confirm convergence
    pub progress_requeue: Duration,
    /// Requeue after the first transient error; doubles with each consecutive failure
    pub error_requeue: Duration,
    /// Upper bound for the requeue delay after repeated transient errors
    pub max_error_requeue: Duration,
    /// Re-read-and-recompute rounds allowed after optimistic-concurrency conflicts
    pub max_conflict_attempts: u32,
    /// In-pass retry budget for reads
    pub read_retry: RetryConfig,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            pass_deadline: Duration::from_secs(60),
            resync_interval: Duration::from_secs(300),
            progress_requeue: Duration::from_secs(5),
            error_requeue: Duration::from_secs(30),
            max_error_requeue: Duration::from_secs(300),
            max_conflict_attempts: 3,
            read_retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 2.0,
            },
        }
    }
}
