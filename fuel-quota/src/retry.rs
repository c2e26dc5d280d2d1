use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Configuration for retrying store operations that hit transient contention
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try
    pub max_retries: u32,

    /// Backoff before the first retry, in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound for a single backoff, in milliseconds
    pub max_backoff_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Factor to apply random jitter (0-1)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 20,
            max_backoff_ms: 500,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Executes an async store operation, retrying only on [`StoreError::Busy`].
///
/// Attempts always run to completion: a store reports its own deadline as
/// `Busy` once it knows nothing was written, so a failed attempt never
/// lands later. Returns the result of the operation or the last error
/// encountered.
pub async fn with_retry<F, Fut, T>(mut operation: F, config: &RetryConfig) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut current_retry = 0;
    let mut current_backoff = Duration::from_millis(config.initial_backoff_ms);
    let max_backoff = Duration::from_millis(config.max_backoff_ms);

    loop {
        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        if !error.is_retryable() || current_retry >= config.max_retries {
            return Err(error);
        }

        let jitter_range = (current_backoff.as_millis() as f64 * config.jitter_factor) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        let sleep_duration = current_backoff.saturating_add(Duration::from_millis(jitter));

        log::warn!(
            "Usage store busy ({}), retry {} of {} in {:?}",
            error,
            current_retry + 1,
            config.max_retries,
            sleep_duration
        );
        tokio::time::sleep(sleep_duration).await;

        current_retry += 1;

        let next_backoff_millis = current_backoff.as_millis() as f64 * config.backoff_multiplier;
        current_backoff = Duration::from_millis(next_backoff_millis.min(max_backoff.as_millis() as f64) as u64);
    }
}
