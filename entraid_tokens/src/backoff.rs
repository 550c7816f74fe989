//! Backoff between failed refresh cycles
//!
//! Within a cycle, failed requests are retried according to the
//! [`RetryPolicy`][crate::RetryPolicy]. Once a cycle has given up and the last
//! good token has already expired, there is no natural refresh point left, so
//! subsequent cycles are spaced out by an increasing backoff.

use std::time::Duration;

/// Configuration for spacing out refresh cycles after repeated failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial error delay of 100 ms with a multiplier of 2. Maximum delay is
    /// capped at 15 seconds.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_millis(100),
            max_error_delay: Duration::from_secs(15),
            multiplier: 2,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// After the first failed cycle, the backoff will be `initial_error_delay`.
    /// Each further consecutive failure multiplies the backoff by `multiplier`,
    /// with a cap of `max_error_delay`.
    pub const fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
        }
    }
}

/// A stateful handler that tracks consecutive failed cycles
#[derive(Debug)]
pub(crate) struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    last_delay: Option<Duration>,
}

impl ErrorBackoffHandler {
    pub(crate) fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            last_delay: None,
        }
    }

    /// Reports a successful cycle, resetting the backoff
    pub(crate) fn success(&mut self) {
        self.last_delay = None;
    }

    /// Reports a failed cycle and returns the delay before the next one
    pub(crate) fn error(&mut self) -> Duration {
        let new_delay = match self.last_delay {
            Some(last) => last
                .saturating_mul(self.config.multiplier)
                .min(self.config.max_error_delay),
            None => self.config.initial_error_delay,
        };
        self.last_delay = Some(new_delay);
        new_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_until_capped_and_resets_on_success() {
        let mut handler = ErrorBackoffHandler::new(ErrorBackoffConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            2,
        ));

        assert_eq!(handler.error(), Duration::from_millis(100));
        assert_eq!(handler.error(), Duration::from_millis(200));
        assert_eq!(handler.error(), Duration::from_millis(350));
        assert_eq!(handler.error(), Duration::from_millis(350));

        handler.success();
        assert_eq!(handler.error(), Duration::from_millis(100));
    }
}
