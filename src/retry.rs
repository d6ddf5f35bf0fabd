use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RetryConfig;
use crate::error::{AppError, Result};

/// Source of delays between attempts. Swapped out in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Exponential backoff retry policy.
///
/// After failed attempt `n` (1-based) the policy waits `base^n` seconds
/// before trying again, as long as the error is retryable and attempts
/// remain. No delay follows the final attempt.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_secs: f64,
    retryable: fn(&AppError) -> bool,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_secs", &self.base_secs)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_secs: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_secs,
            retryable: AppError::is_transient,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base_secs)
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_predicate(mut self, retryable: fn(&AppError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        Duration::try_from_secs_f64(self.base_secs.powi(exponent)).unwrap_or(Duration::MAX)
    }

    pub fn is_retryable(&self, error: &AppError) -> bool {
        (self.retryable)(error)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if attempt < self.max_attempts && self.is_retryable(&e) => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_secs = backoff.as_secs_f64(),
                        error = %e,
                        "Transient failure, retrying after backoff"
                    );
                    self.sleeper.sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
