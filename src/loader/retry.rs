//! Retry/Timeout Policy
//!
//! Each fetch attempt races a deadline; a late result is never observed
//! because the attempt future is dropped when the deadline wins. Attempts are
//! separated by a fixed delay and bounded by a maximum count.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::error::LoadError;
use super::fetch::FetchFailure;
use super::path::CanonicalId;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default maximum number of attempts.
pub const DEFAULT_ATTEMPTS: u32 = 3;
/// Default delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Maximum number of attempts (at least one is always made).
    pub attempts: u32,
    /// Pause between two attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// A successful run and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Run `attempt` until it succeeds or the attempt budget is spent.
    ///
    /// `attempt` receives the 1-based attempt number. On exhaustion the error
    /// is `RetriesExhausted` wrapping the final attempt's error.
    pub async fn run<T, F, Fut>(&self, id: &CanonicalId, mut attempt: F) -> Result<Attempted<T>, LoadError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchFailure>>,
    {
        let max = self.attempts.max(1);
        let mut last = None;

        for n in 1..=max {
            if n > 1 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let error = match tokio::time::timeout(self.timeout, attempt(n)).await {
                Ok(Ok(value)) => {
                    debug!(target: "modshell::retry", %id, attempt = n, "Fetch succeeded");
                    return Ok(Attempted { value, attempts: n });
                }
                Ok(Err(failure)) => LoadError::FetchFailed {
                    id: id.clone(),
                    attempt: n,
                    reason: failure.to_string(),
                },
                Err(_) => LoadError::FetchTimeout {
                    id: id.clone(),
                    attempt: n,
                    timeout: self.timeout,
                },
            };
            warn!(target: "modshell::retry", %id, attempt = n, max, error = %error, "Fetch attempt failed");
            last = Some(error);
        }

        Err(LoadError::RetriesExhausted {
            id: id.clone(),
            attempts: max,
            last: Box::new(last.unwrap_or_else(|| LoadError::FetchFailed {
                id: id.clone(),
                attempt: max,
                reason: "no attempt made".to_string(),
            })),
        })
    }
}
