//! Cancellable timed waits.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Result, WhaleError};

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WhaleError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Drive `future` unless `cancel` fires first. The future is dropped on
/// cancellation, so a request still in flight is abandoned.
pub async fn cancellable<F, T>(future: F, cancel: &CancellationToken) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WhaleError::Cancelled),
        result = future => result,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Converged,
    TimedOut { waited: Duration },
}

/// Call `check` every `interval` until it returns `Ok(true)`, `timeout`
/// elapses, or `cancel` fires.
///
/// An `Err` from `check` ends the poll immediately; callers that want to
/// ride out transient failures should swallow them inside `check`. A check
/// still running when the deadline passes or `cancel` fires is abandoned.
/// A `TimedOut` outcome is never reported before `timeout` has elapsed.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let deadline = start + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(WhaleError::Cancelled);
        }

        let converged = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WhaleError::Cancelled),
            result = check() => result?,
            _ = tokio::time::sleep_until(deadline) => {
                return Ok(PollOutcome::TimedOut {
                    waited: start.elapsed(),
                });
            }
        };
        if converged {
            return Ok(PollOutcome::Converged);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut {
                waited: now - start,
            });
        }

        trace!("condition not met yet, polling again");
        sleep_or_cancel(interval.min(deadline - now), cancel).await?;
    }
}
