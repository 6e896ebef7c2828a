//! Retry and backoff patterns for handling transient coordination failures
//!
//! Two shapes are used by the agent:
//!
//! - [`ExponentialBackoff`]: stateful delays for long-running loops (watchers,
//!   the version store connect loop) that retry until they are stopped.
//! - [`retry`]: a bounded, fixed-interval retry of a single async operation,
//!   used for CAS writes of the cluster and per-node status.

use crate::error::{UiUpdateError, UiUpdateResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Parameters of an exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// First delay
    pub min: Duration,
    /// Upper bound for every delay
    pub max: Duration,
    /// Growth factor between consecutive delays
    pub factor: f64,
    /// Randomise each delay between half and the full value
    pub jitter: bool,
}

impl BackoffConfig {
    /// Backoff for re-arming a watch after a failed watch request
    pub fn watcher() -> Self {
        Self {
            min: Duration::from_secs(5),
            max: Duration::from_secs(5 * 60),
            factor: 2.0,
            jitter: false,
        }
    }

    /// Backoff for the version store's initial connect loop
    pub fn connect() -> Self {
        Self {
            min: Duration::from_secs(15),
            max: Duration::from_secs(5 * 60),
            factor: 2.0,
            jitter: false,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::watcher()
    }
}

/// Stateful exponential backoff
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.config.factor.powi(self.attempt.min(64) as i32);
        self.attempt = self.attempt.saturating_add(1);

        let delay_ms = self.config.min.as_millis() as f64 * factor;
        let max_ms = self.config.max.as_millis() as f64;
        let mut delay = Duration::from_millis(delay_ms.min(max_ms) as u64);

        if self.config.jitter {
            use rand::Rng;
            let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay = Duration::from_millis((delay.as_millis() as f64 * jitter_factor) as u64);
        }

        delay
    }
}

/// Bounded retry with a fixed pause between attempts
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial attempt)
    pub max_attempts: u32,
    /// Pause between attempts
    pub interval: Duration,
    /// Function to determine if an error is retryable
    pub is_retryable: fn(&UiUpdateError) -> bool,
    /// Operation name used in log lines
    pub operation_name: String,
}

impl RetryConfig {
    pub fn fixed(operation_name: impl Into<String>, max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            is_retryable: default_is_retryable,
            operation_name: operation_name.into(),
        }
    }

    pub fn with_retryable(mut self, is_retryable: fn(&UiUpdateError) -> bool) -> Self {
        self.is_retryable = is_retryable;
        self
    }
}

/// Coordination failures are worth another attempt; local and registry errors are not
fn default_is_retryable(error: &UiUpdateError) -> bool {
    matches!(
        error,
        UiUpdateError::Coordination { .. } | UiUpdateError::ZookeeperNotConnected
    )
}

/// Retry an async operation with the given configuration
pub async fn retry<F, Fut, T>(config: &RetryConfig, mut operation: F) -> UiUpdateResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UiUpdateResult<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        "{} succeeded after {} attempts",
                        config.operation_name, attempt
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if attempt >= config.max_attempts {
                    warn!(
                        "{}: max retry attempts ({}) reached: {}",
                        config.operation_name, config.max_attempts, error
                    );
                    return Err(error);
                }

                if !(config.is_retryable)(&error) {
                    debug!("{}: error is not retryable: {}", config.operation_name, error);
                    return Err(error);
                }

                warn!(
                    "Retry attempt {}/{} for {} after error: {} (waiting {:?})",
                    attempt, config.max_attempts, config.operation_name, error, config.interval
                );
                sleep(config.interval).await;
            }
        }
    }
}
