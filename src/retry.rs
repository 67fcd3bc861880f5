//! Bounded fixed-delay retry.
//!
//! Both the scheduler (task admission) and the HTTP service (ranged GETs)
//! share this loop so no failure crosses a retry boundary as a panic.

use std::time::Duration;

use crate::error::{DownloadError, DownloadResult};

/// How many times to try and how long to sleep between tries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first). Never zero.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// Runs `op` until it succeeds or the policy is exhausted, sleeping
/// `policy.delay` between attempts. Returns the last error on exhaustion.
pub fn run_with_retry<T, F>(policy: &RetryPolicy, mut op: F) -> DownloadResult<T>
where
    F: FnMut() -> DownloadResult<T>,
{
    let mut last: Option<DownloadError> = None;
    for attempt in 1..=policy.max_attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(attempt, max = policy.max_attempts, error = %e, "attempt failed");
                last = Some(e);
                if attempt < policy.max_attempts {
                    std::thread::sleep(policy.delay);
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| DownloadError::unexpected("retry loop ran zero attempts")))
}
