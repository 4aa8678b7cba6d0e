//! Retrying channel operations with exponential backoff.
//!
//! Only errors whose kind is retryable are retried: `Timeout`, `ServerBusy`
//! and `Communication`. Everything else, configuration and authentication
//! failures in particular, is returned on the first attempt.
//!
//! # Example
//!
//! ```ignore
//! use channelrpc_client::{RetryPolicy, retry_with_policy};
//!
//! let policy = RetryPolicy::default().max_retries(5);
//! let reply = retry_with_policy(&policy, || async {
//!     let channel = factory.create_request_channel(to.clone(), None)?;
//!     channel.request(Message::new("urn:svc/Ping"), timeout).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use channelrpc_core::ChannelError;

/// Default backoff parameters.
pub mod defaults {
    use std::time::Duration;

    pub const BASE_DELAY: Duration = Duration::from_millis(500);
    pub const MULTIPLIER: f64 = 1.6;
    /// 0.2 means +/- 20%.
    pub const JITTER: f64 = 0.2;
    pub const MAX_DELAY: Duration = Duration::from_secs(30);
    pub const MAX_RETRIES: u32 = 3;
}

/// Retry configuration.
///
/// ```
/// use channelrpc_client::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new()
///     .max_retries(5)
///     .base_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_secs(5));
/// assert!(policy.validate().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Growth factor per attempt. At least 1.0.
    pub multiplier: f64,
    /// Fraction of each delay randomized in both directions, 0.0 to 1.0.
    pub jitter: f64,
    pub max_delay: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: defaults::BASE_DELAY,
            multiplier: defaults::MULTIPLIER,
            jitter: defaults::JITTER,
            max_delay: defaults::MAX_DELAY,
            max_retries: defaults::MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the policy parameters.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.base_delay > self.max_delay {
            return Err(ChannelError::configuration(
                "retry base_delay must not exceed max_delay",
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(ChannelError::configuration(
                "retry multiplier must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ChannelError::configuration(
                "retry jitter must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.clone())
    }
}

/// Sequence of jittered, exponentially growing delays.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    current_secs: f64,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        let current_secs = policy.base_delay.as_secs_f64();
        Self {
            policy,
            current_secs,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.policy.max_retries
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let max = self.policy.max_delay.as_secs_f64();
        let jitter = self.policy.jitter;
        let delay = if jitter > 0.0 {
            let factor = rand::random::<f64>() * 2.0 * jitter - jitter;
            self.current_secs * (1.0 + factor)
        } else {
            self.current_secs
        };

        self.current_secs = (self.current_secs * self.policy.multiplier).min(max);
        self.attempts += 1;

        Duration::from_secs_f64(delay.clamp(0.0, max))
    }
}

/// Retry with [`RetryPolicy::default`].
pub async fn retry<F, Fut, T>(f: F) -> Result<T, ChannelError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ChannelError>>,
{
    retry_with_policy(&RetryPolicy::default(), f).await
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up.
pub async fn retry_with_policy<F, Fut, T>(policy: &RetryPolicy, f: F) -> Result<T, ChannelError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ChannelError>>,
{
    policy.validate()?;
    let mut backoff = policy.backoff();

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && backoff.can_retry() => {
                let delay = backoff.next_delay();
                tracing::debug!(
                    error = %err,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
