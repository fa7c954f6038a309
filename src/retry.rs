use std::future::Future;

use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use crate::error::GenerationError;
use crate::replicate::{ProviderError, ProviderErrorKind};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: the wait after attempt `n` is `base_delay * n`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Runs `attempt_fn` until it succeeds, the provider rejects the content, or
/// the attempt budget is spent. Only interruptions are retried.
pub async fn with_retries<T, F, Fut>(
    mut attempt_fn: F,
    policy: &RetryPolicy,
) -> Result<T, GenerationError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        info!(attempt, max_attempts, "generating image");
        let err = match attempt_fn(attempt).await {
            Ok(output) => return Ok(output),
            Err(err) => err,
        };
        warn!(attempt, kind = ?err.kind, error = %err.message, "generation attempt failed");

        match err.kind {
            ProviderErrorKind::Sensitive => {
                return Err(GenerationError::ContentRejected { detail: err.message });
            }
            ProviderErrorKind::Interrupted if attempt < max_attempts => {
                sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
            ProviderErrorKind::Interrupted | ProviderErrorKind::Other => {
                return Err(GenerationError::GenerationFailed(err.message));
            }
        }
    }
}
