//! Cancelable operations.
//!
//! Wraps any future with an explicit cancellation signal. Once canceled, the
//! wrapper resolves to [`Canceled`] and whatever the inner future eventually
//! produces is discarded.

use std::future::Future;

use thiserror::Error;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Distinguished outcome of an operation abandoned by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation canceled")]
pub struct Canceled;

/// Handle used to cancel an operation created by [`cancelable`] or [`spawn_cancelable`].
///
/// Cloning the handle shares the same signal. Canceling more than once is a no-op,
/// and so is canceling after the operation has already settled.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Fire the cancellation signal.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!("Canceling operation");
            self.token.cancel();
        }
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The underlying token, for propagating the signal into nested work.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Wrap `inner` so it can be abandoned.
///
/// The inner future is driven in place by the returned future; dropping it
/// drops `inner` too.
pub fn cancelable<F>(inner: F) -> (impl Future<Output = Result<F::Output, Canceled>>, CancelHandle)
where
    F: Future,
{
    let token = CancellationToken::new();
    let handle = CancelHandle::new(token.clone());
    (with_cancellation(inner, token), handle)
}

/// Run `inner` until it completes or `token` fires, whichever happens first.
///
/// Cancellation is checked before the inner future on every poll, so an
/// already-fired token always wins.
pub async fn with_cancellation<F>(inner: F, token: CancellationToken) -> Result<F::Output, Canceled>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Canceled),
        output = inner => Ok(output),
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawn `inner` as a task and return a cancelable future for its output.
///
/// Unlike [`cancelable`], canceling (or dropping the returned future) also
/// aborts the spawned task, so the inner work does not keep running.
pub fn spawn_cancelable<F>(
    inner: F,
) -> (impl Future<Output = Result<F::Output, Canceled>>, CancelHandle)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let token = CancellationToken::new();
    let handle = CancelHandle::new(token.clone());
    let task = tokio::spawn(inner);
    let guard = AbortOnDrop(task.abort_handle());

    let future = async move {
        let _guard = guard;
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Canceled),
            joined = task => match joined {
                Ok(output) => Ok(output),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(Canceled),
            },
        }
    };

    (future, handle)
}
