//! Exponential backoff.
//!
//! A [`RetryPolicy`] answers one question: how long to pause after the n-th
//! failure. The router asks it between delivery attempts of a subscription
//! (the attempt bound itself lives on the subscription), and
//! [`retry_with_backoff`] uses it to bound repeated dead-letter writes.
//!
//! # Example
//!
//! ```rust
//! use rowflow_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(2)
//!     .initial_delay(Duration::from_millis(50))
//!     .max_delay(Duration::from_secs(1))
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
//!
//! let written = retry_with_backoff(policy, "dead-letter write", || async {
//!     Ok::<_, String>("stored")
//! })
//! .await?;
//! assert_eq!(written, "stored");
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Backoff schedule.
///
/// Defaults: 3 retries, 100ms first pause doubling up to 30s, no jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first failure; only [`retry_with_backoff`] reads it
    pub max_retries: u32,
    /// Pause after the first failure
    pub initial_delay: Duration,
    /// Upper bound of any pause
    pub max_delay: Duration,
    /// Growth factor between consecutive pauses
    pub multiplier: f64,
    /// Scale each pause by a random factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Start from the defaults.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self {
                max_retries: 3,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: false,
            },
        }
    }

    /// Pause after failure number `attempt`, counting from 0.
    ///
    /// `min(initial_delay * multiplier^attempt, max_delay)`, optionally
    /// jittered.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_millis() as f64;
        let grown = self.initial_delay.as_millis() as f64
            * self
                .multiplier
                .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let mut millis = if grown.is_finite() { grown.min(cap) } else { cap };

        if self.jitter {
            millis *= rand::thread_rng().gen_range(0.5..=1.0);
        }

        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Retries after the first failure.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Pause after the first failure.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Upper bound of any pause.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Growth factor between pauses.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Randomize pauses.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Finish.
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Run `operation` until it succeeds or `policy.max_retries` retries failed.
///
/// `label` names the operation in logs.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut failures = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    tracing::info!(operation = label, failures, "Recovered after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if failures >= policy.max_retries {
            tracing::error!(operation = label, failures = failures + 1, error = %err, "Giving up");
            return Err(err);
        }

        let delay = policy.delay_for_attempt(failures);
        tracing::debug!(
            operation = label,
            failures = failures + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Attempt failed"
        );
        tokio::time::sleep(delay).await;
        failures += 1;
    }
}
