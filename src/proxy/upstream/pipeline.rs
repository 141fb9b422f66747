use crate::error::ClientError;
use std::error::Error as _;
use std::future::Future;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(6)
    }
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, or
/// the policy's attempt cap is spent. The closure receives the 1-based
/// attempt number and is expected to re-resolve its proxy every time.
pub async fn run_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    action: &str,
    mut attempt: F,
) -> Result<T, ClientError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut current = 0usize;
    loop {
        current += 1;
        match attempt(current).await {
            Ok(value) => {
                if current > 1 {
                    debug!(
                        "[Upstream] {} succeeded on attempt {}/{}",
                        action, current, max_attempts
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && current < max_attempts => {
                debug!(
                    "[Upstream] {} attempt {}/{} failed, retrying: {}",
                    action, current, max_attempts, err
                );
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(
                        "[Upstream] {} gave up after {} attempts: {}",
                        action, max_attempts, err
                    );
                }
                return Err(err);
            }
        }
    }
}

/// True for transport-level failures: timeouts, refused or reset
/// connections, proxy connect failures, dropped connections.
pub fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
            ) {
                return true;
            }
        }
        source = inner.source();
    }
    // Server closed the connection before sending a response.
    err.is_request() && !err.is_builder()
}
