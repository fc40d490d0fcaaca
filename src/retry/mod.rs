// src/retry/mod.rs

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ApiError, Result, StorageError};

/// Substrings (matched case-insensitively) that mark an error as worth
/// retrying. The generic "query failed" marker catches driver wrappers
/// that swallow the underlying cause. The error module classifies
/// storage failures against this same list.
pub const TRANSIENT_MARKERS: [&str; 10] = [
    "connection refused",
    "timed out",
    "timeout",
    "host not found",
    "unreachable",
    "connection lost",
    "deadlock",
    "lock timeout",
    "too many connections",
    "query failed",
];

/// Configuration for retry strategy
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: usize,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        // min(200 * 2^(n-1), 5000) ms over 3 attempts
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Delay before retry `attempt` (1-based): doubles from the initial
    /// backoff, capped at the maximum
    fn delay_for(&self, attempt: usize) -> Duration {
        let shift = (attempt - 1).min(31) as u32;
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Whether an error may succeed on retry.
///
/// `KvUnavailable` and transient storage errors are structural matches;
/// everything else falls back to message inspection.
pub fn is_transient(err: &ApiError) -> bool {
    match err {
        ApiError::KvUnavailable(_) => true,
        ApiError::Storage(StorageError::Transient(_)) => true,
        ApiError::Storage(StorageError::Fatal(message)) => {
            let lowered = message.to_lowercase();
            TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m))
        }
        _ => {
            let lowered = err.to_string().to_lowercase();
            TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m))
        }
    }
}

/// Run a fallible operation with exponential backoff between attempts.
///
/// Non-transient errors propagate immediately. After the attempt budget
/// is exhausted the last error propagates unchanged.
pub async fn with_retry<T, F, Fut>(operation: &str, config: &RetryConfig, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                if attempt >= config.max_attempts {
                    warn!(operation, error = %err, "retries exhausted");
                    return Err(err);
                }
                attempt += 1;
                let delay = config.delay_for(attempt);
                debug!(
                    operation,
                    attempt,
                    ?delay,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
