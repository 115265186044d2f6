use crate::{Error, Result};
use std::future::Future;
use tokio::time::{self, Duration, Instant};

/// The outcome of a single non-blocking attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress<T> {
    Ready(T),
    Pending,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PollConfig {
    interval: Duration,
    timeout: Duration,
}

// === impl PollConfig ===

impl PollConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
    pub const MIN_INTERVAL: Duration = Duration::from_millis(500);
    pub const MAX_INTERVAL: Duration = Duration::from_secs(30);

    /// The interval is clamped to `[MIN_INTERVAL, MAX_INTERVAL]`.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: interval.clamp(Self::MIN_INTERVAL, Self::MAX_INTERVAL),
            timeout,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Invokes `attempt` every `interval` until it is ready, fails, or the
/// timeout elapses.
///
/// Errors from `attempt` end polling immediately. If the timeout elapses while
/// still pending, a [`Error::Pending`] naming `what` is returned. The attempt
/// is always made at least once, and once more at the deadline.
pub async fn poll_until_ready<T, F, Fut>(what: &str, config: &PollConfig, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress<T>>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut attempts = 0usize;
    loop {
        attempts += 1;
        if let Progress::Ready(value) = attempt().await? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::debug!(what, attempts, "Gave up waiting");
            return Err(Error::Pending(what.to_string()));
        }
        tracing::trace!(what, attempts, "Still pending");
        time::sleep_until((now + config.interval).min(deadline)).await;
    }
}
