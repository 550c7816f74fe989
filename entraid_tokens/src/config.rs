//! Configuration for token acquisition and proactive renewal

use std::time::Duration;

use serde::Deserialize;

use crate::{clock::UnixMillis, error::ConfigurationError, Token};

/// How many times, and how often, a failed token request is retried
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    max_attempts: u32,
    #[serde(with = "humantime_serde")]
    delay: Duration,
}

impl RetryPolicy {
    /// Default maximum number of attempts per acquisition
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Default pause between attempts
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(3);

    /// Constructs a new retry policy
    ///
    /// A token request will be attempted at most `max_attempts` times, pausing
    /// for `delay` between attempts. Only transient failures are retried.
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// The maximum number of attempts per acquisition
    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The pause between attempts
    #[inline]
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    /// Three attempts, 3 ms apart
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_DELAY)
    }
}

/// Configuration for determining when a token should be renewed and how
/// renewal requests are executed
///
/// A token is renewed once `expiration_refresh_ratio` of its lifetime has
/// elapsed, but never later than `lower_refresh_bound` before it expires.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    expiration_refresh_ratio: f64,
    #[serde(with = "humantime_serde")]
    lower_refresh_bound: Duration,
    #[serde(with = "humantime_serde")]
    request_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl Default for RefreshConfig {
    /// Default refresh configuration
    ///
    /// Renews at 80% of a token's lifetime with no lower bound, allowing each
    /// request 100 ms, with the default [`RetryPolicy`].
    fn default() -> Self {
        Self {
            expiration_refresh_ratio: Self::DEFAULT_EXPIRATION_REFRESH_RATIO,
            lower_refresh_bound: Self::DEFAULT_LOWER_REFRESH_BOUND,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl RefreshConfig {
    /// Default fraction of a token's lifetime after which it is renewed
    pub const DEFAULT_EXPIRATION_REFRESH_RATIO: f64 = 0.8;

    /// Default minimum remaining validity at which a token is renewed
    pub const DEFAULT_LOWER_REFRESH_BOUND: Duration = Duration::ZERO;

    /// Default limit on the duration of a single token request
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

    /// Constructs a new refresh configuration with the default request
    /// timeout and retry policy
    pub fn new(expiration_refresh_ratio: f64, lower_refresh_bound: Duration) -> Self {
        Self {
            expiration_refresh_ratio,
            lower_refresh_bound,
            ..Self::default()
        }
    }

    /// Sets the fraction of a token's lifetime after which it is renewed
    pub fn with_expiration_refresh_ratio(mut self, ratio: f64) -> Self {
        self.expiration_refresh_ratio = ratio;
        self
    }

    /// Sets the minimum remaining validity at which a token is always renewed
    pub fn with_lower_refresh_bound(mut self, bound: Duration) -> Self {
        self.lower_refresh_bound = bound;
        self
    }

    /// Sets the limit on the duration of a single token request
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry policy for failed token requests
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// The fraction of a token's lifetime after which it is renewed
    #[inline]
    pub fn expiration_refresh_ratio(&self) -> f64 {
        self.expiration_refresh_ratio
    }

    /// The minimum remaining validity at which a token is renewed
    #[inline]
    pub fn lower_refresh_bound(&self) -> Duration {
        self.lower_refresh_bound
    }

    /// The limit on the duration of a single token request
    #[inline]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// The retry policy for failed token requests
    #[inline]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Checks that the configuration describes a usable refresh schedule
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let ratio = self.expiration_refresh_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigurationError::invalid(
                "expiration_refresh_ratio",
                format!("must be within (0, 1], got {}", ratio),
            ));
        }

        if self.retry_policy.max_attempts == 0 {
            return Err(ConfigurationError::invalid(
                "max_attempts",
                "must allow at least one attempt",
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigurationError::invalid(
                "request_timeout",
                "must be greater than zero",
            ));
        }

        Ok(())
    }

    /// The time at which `token` should be renewed
    pub fn renewal_time(&self, token: &Token) -> UnixMillis {
        let fresh_millis =
            (token.ttl().as_millis() as f64 * self.expiration_refresh_ratio).round() as u64;
        let by_ratio = token.received_at() + Duration::from_millis(fresh_millis);
        let by_bound = token.expires_at() - self.lower_refresh_bound;
        by_ratio.min(by_bound)
    }

    /// How long to wait, as of `now`, before renewing `token`
    pub fn renewal_delay(&self, token: &Token, now: UnixMillis) -> Duration {
        self.renewal_time(token).saturating_duration_since(now)
    }
}
