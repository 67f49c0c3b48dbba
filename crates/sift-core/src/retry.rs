use std::future::Future;

use crate::article::BackoffConfig;
use crate::error::AppError;

/// Run `op`, retrying retryable errors with exponential backoff.
///
/// Non-retryable errors are returned immediately. After `max_retries`
/// retries the last error is returned.
pub async fn with_backoff<T, F, Fut>(config: &BackoffConfig, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retry < config.max_retries => {
                retry += 1;
                let delay = config.delay_for_retry(retry);
                tracing::warn!(
                    error = %e,
                    retry,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
