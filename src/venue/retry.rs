//! Bounded retry with exponential backoff and a per-call deadline.

use super::VenueError;
use backoff::future::retry_notify;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

/// Retry and timeout parameters for venue calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for a single attempt; expiry counts as a transient failure.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Only transient errors are retried. `Rejected`, `NotFound` and
/// `Unauthorized` surface on the first occurrence. A timed out attempt is
/// reported as `VenueError::Timeout`, never as success.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let call_timeout = policy.call_timeout;
    let timeout_ms = call_timeout.as_millis() as u64;
    let attempts = AtomicU32::new(0);

    let backoff = ExponentialBackoff {
        initial_interval: policy.initial_delay,
        max_interval: policy.max_delay,
        max_elapsed_time: None,
        ..Default::default()
    };

    retry_notify(
        backoff,
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let call = op();
            async move {
                let outcome = match tokio::time::timeout(call_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(VenueError::Timeout(timeout_ms)),
                };
                outcome.map_err(|err| {
                    if err.is_transient() && attempt < max_attempts {
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
            }
        },
        |err: VenueError, delay: Duration| {
            warn!(
                op = op_name,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Transient venue failure, retrying"
            );
        },
    )
    .await
}
