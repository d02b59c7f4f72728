//! Retry strategy with exponential backoff for transient errors.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stowage_common::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay after the failure of attempt `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Retry executor for running operations with retry logic.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an operation, retrying every failure.
    ///
    /// Waits between attempts race `cancel`; there is no wait after the
    /// final attempt.
    ///
    /// # Errors
    /// - `InvalidArgument` if `max_attempts` is 0
    /// - `Cancelled` if `cancel` fires while waiting
    /// - `MaxRetriesExceeded` wrapping the last failure
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(cancel, operation, |_| true)
            .await
    }

    /// Execute with a custom retry condition.
    ///
    /// Errors rejected by `should_retry` are returned as-is, without the
    /// `MaxRetriesExceeded` wrapper.
    pub async fn execute_with_condition<F, Fut, T, C>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        should_retry: C,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let max_attempts = self.config.max_attempts;
        if max_attempts == 0 {
            return Err(Error::InvalidArgument(
                "retry needs at least one attempt".to_string(),
            ));
        }

        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !should_retry(&err) {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt >= max_attempts {
                        warn!("Operation failed after {} attempts: {}", attempt, err);
                        return Err(Error::MaxRetriesExceeded {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Retry `operation` up to `max_attempts` times with the default backoff
/// (100ms doubling, capped at 5s).
pub async fn retry<F, Fut, T>(cancel: &CancellationToken, max_attempts: u32, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::new(RetryConfig::new(max_attempts))
        .execute(cancel, operation)
        .await
}
