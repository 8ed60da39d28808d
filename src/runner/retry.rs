use crate::config::RetryConfig;
use crate::error::{Classify, ErrorKind};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Delay before retry number `attempt` (1-based): base * multiplier^(attempt - 1)
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = config
        .backoff_multiplier
        .powi(attempt.saturating_sub(1) as i32);
    Duration::from_millis((config.backoff_base_ms as f64 * factor).round() as u64)
}

/// Execute an async operation with exponential backoff.
///
/// Only `Retryable` errors are retried; any other kind is returned at once.
/// Returns the result together with the number of attempts made.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Classify,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return (Ok(result), attempts),
            Err(e) if e.kind() != ErrorKind::Retryable => {
                warn!("Attempt {} failed ({}), not retrying: {}", attempts, e.kind(), e);
                return (Err(e), attempts);
            }
            Err(e) if attempts >= config.max_attempts => {
                warn!("All {} attempts failed: {}", attempts, e);
                return (Err(e), attempts);
            }
            Err(e) => {
                let delay = backoff_delay(config, attempts);
                warn!(
                    "Attempt {} failed: {}. Retrying in {:?}...",
                    attempts, e, delay
                );
                sleep(delay).await;
            }
        }
    }
}
