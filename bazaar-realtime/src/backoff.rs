//! Reconnect delay policy shared by every channel.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a channel waits before re-issuing its subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// Same delay before every attempt.
    Fixed { delay: Duration },
    /// `initial * factor^(attempt - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: u32,
    },
}

impl BackoffPolicy {
    pub const fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed { delay }
    }

    pub const fn exponential(initial: Duration, max: Duration) -> Self {
        BackoffPolicy::Exponential {
            initial,
            max,
            factor: 2,
        }
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay } => delay,
            BackoffPolicy::Exponential { initial, max, factor } => {
                let exponent = attempt.saturating_sub(1);
                factor
                    .checked_pow(exponent)
                    .and_then(|scale| initial.checked_mul(scale))
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::fixed(Duration::from_secs(5))
    }
}
