//! Bounded retry with exponential backoff and jitter.

use rand::Rng;
use std::{
    future::Future,
    time::Duration,
};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. Always at least one attempt is made.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::conflict()
    }
}

impl RetryConfig {
    /// Budget for writes that fail with an optimistic concurrency conflict.
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

/// Runs `operation` until it succeeds, fails with an error `retryable` rejects, or the attempts are used up.
///
/// The last error is returned once the budget is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        if !retryable(&err) {
            return Err(err);
        }

        if attempt >= config.max_attempts.max(1) {
            warn!(operation = %operation_name, attempt, error = %err, "giving up after max retries");
            return Err(err);
        }

        // 0.5x to 1.5x
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        debug!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered_delay.as_millis(),
            "retrying"
        );

        tokio::time::sleep(jittered_delay).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
