//! Bounded retry for operations that cross hosts or shared filesystems.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Runs an async operation up to `max_tries` times, sleeping `wait` between attempts.
#[derive(Debug, Clone, Copy)]
pub struct Retryer {
    max_tries: u32,
    wait: Duration,
}

impl Retryer {
    /// Create a retryer. `max_tries` below one is treated as one.
    pub fn new(max_tries: u32, wait: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            wait,
        }
    }

    /// A retryer that makes exactly one attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// Returns the first success immediately; on exhaustion returns the last
    /// error exactly as the operation produced it.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(op, |_| true).await
    }

    /// Like [`Retryer::run`], but errors for which `transient` is false are returned at once.
    pub async fn run_if<T, E, F, Fut>(&self, mut op: F, transient: impl Fn(&E) -> bool) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_tries || !transient(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_tries = self.max_tries,
                        wait_secs = self.wait.as_secs(),
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(self.wait).await;
                    attempt += 1;
                }
            }
        }
    }
}
