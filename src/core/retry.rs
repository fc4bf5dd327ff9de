/// Fixed-delay retry policy shared by dump, stop, start and restore steps

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// Upper bound for a single attempt; `None` waits indefinitely
    pub attempt_timeout: Option<Duration>,
}

/// Returned when every attempt failed
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: String,
}

impl std::fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.last_error, self.attempts)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            attempt_timeout: None,
        }
    }

    /// A single attempt bounded by `timeout`
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            attempt_timeout: Some(timeout),
        }
    }

    /// Run `op` until it succeeds and `accept` approves the value, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. A value rejected by `accept`
    /// counts as a failed attempt, so output that merely looks like success is retried.
    pub async fn run<T, F, Fut, P>(&self, label: &str, mut op: F, accept: P) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        P: Fn(&T) -> Result<(), String>,
    {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.max_attempts {
            debug!("{}: attempt {}/{}", label, attempt, self.max_attempts);

            let result = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::anyhow!("timed out after {}", humantime::format_duration(limit))),
                },
                None => op(attempt).await,
            };

            match result.map_err(|e| format!("{:#}", e)).and_then(|v| accept(&v).map(|_| v)) {
                Ok(value) => return Ok(value),
                Err(reason) => {
                    warn!("{}: attempt {}/{} failed: {}", label, attempt, self.max_attempts, reason);
                    last_error = reason;
                }
            }

            if attempt < self.max_attempts && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        Err(RetryExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}
