//! Completion Poller
//!
//! Bounded polling primitive that turns an asynchronous external state
//! change into a synchronous step outcome. The check runs immediately and
//! then on a fixed interval until it reports done, reports an error, the
//! timeout elapses or the surrounding cancellation token fires.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Result of one check: `Ok(true)` done, `Ok(false)` keep polling, `Err`
/// stop immediately.
pub type PollResult<E> = Result<bool, E>;

/// Why polling stopped without success.
#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("{0}")]
    Check(E),

    #[error("timed out after {elapsed:?} waiting for condition")]
    Timeout { elapsed: Duration },

    #[error("polling cancelled")]
    Cancelled,
}

impl<E> PollError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Interval and overall deadline of a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Poll `check` until it reports done.
///
/// Terminates within `timeout + interval` plus the duration of the last
/// check: sleeps are clamped to the remaining time, and one final check runs
/// at the deadline before the timeout is reported.
pub async fn poll_until<F, Fut, E>(
    mut check: F,
    config: PollConfig,
    cancellation: &CancellationToken,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<E>>,
{
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut attempts: u32 = 0;

    loop {
        if cancellation.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        attempts += 1;
        match check().await {
            Ok(true) => {
                debug!(attempts, elapsed = ?started.elapsed(), "Poll condition met");
                return Ok(());
            }
            Ok(false) => trace!(attempts, "Poll condition not met yet"),
            Err(e) => return Err(PollError::Check(e)),
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(attempts, "Poll timed out");
            return Err(PollError::Timeout {
                elapsed: now - started,
            });
        }

        let wait = config.interval.min(deadline - now);
        tokio::select! {
            _ = cancellation.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
