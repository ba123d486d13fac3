//! Retry controller: bounded retry-with-backoff around a fallible async operation.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::RetryPolicy;
use crate::cancelable::with_cancellation;
use crate::error::ExecError;

/// Run `operation` until it succeeds, fails fatally, or the policy's attempt
/// budget runs out.
///
/// Retryable failures are followed by a backoff sleep (or the server-requested
/// wait for rate-limited responses). Fatal failures are returned as-is. Once
/// `policy.max_attempts` attempts have failed, the last error is wrapped in
/// [`ExecError::RetriesExhausted`].
///
/// Firing `cancel` stops immediately, during an attempt or a backoff sleep,
/// and yields [`ExecError::Canceled`].
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, ExecError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExecError>>,
{
    let mut attempts_made: u32 = 0;

    loop {
        let error = match with_cancellation(operation(), cancel.clone()).await? {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempts_made += 1;

        if error.is_canceled() || !policy.is_retryable(&error) {
            return Err(error);
        }

        if !policy.should_retry(&error, attempts_made) {
            warn!(
                "Giving up after {} attempts, last error: {}",
                attempts_made, error
            );
            return Err(ExecError::RetriesExhausted(Box::new(error)));
        }

        let delay = policy.delay_for(&error, attempts_made - 1);
        debug!(
            "Attempt {} failed ({}), retrying in {:?}",
            attempts_made, error, delay
        );

        with_cancellation(tokio::time::sleep(delay), cancel.clone()).await?;
    }
}
