//! Tunables for one synchronization session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Delay policy between reconnect attempts
    pub backoff: BackoffPolicy,
    /// Give up after this many consecutive failures (None = retry forever)
    pub max_retries: Option<u32>,
    /// Interval between presence "track" heartbeats
    pub presence_heartbeat: Duration,
    /// Peers whose last heartbeat is older than this are evicted
    pub presence_liveness: Duration,
    /// Minimum spacing between outgoing "typing start" broadcasts
    pub typing_throttle: Duration,
    /// Local inactivity after which "typing stop" is sent
    pub typing_idle_stop: Duration,
    /// Remote typing sessions expire after this long without a refresh
    pub typing_ttl: Duration,
    /// Period of the remote typing sweep
    pub typing_sweep: Duration,
    /// Maximum number of queued user-visible failures
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_retries: None,
            presence_heartbeat: Duration::from_secs(10),
            presence_liveness: Duration::from_secs(30),
            typing_throttle: Duration::from_secs(2),
            typing_idle_stop: Duration::from_secs(5),
            typing_ttl: Duration::from_secs(10),
            typing_sweep: Duration::from_secs(1),
            queue_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_presence(mut self, heartbeat: Duration, liveness: Duration) -> Self {
        self.presence_heartbeat = heartbeat;
        self.presence_liveness = liveness;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.backoff, BackoffPolicy::fixed(Duration::from_secs(5)));
        assert_eq!(config.max_retries, None);
        assert_eq!(config.typing_throttle, Duration::from_secs(2));
        assert_eq!(config.typing_idle_stop, Duration::from_secs(5));
        assert_eq!(config.typing_ttl, Duration::from_secs(10));
        assert_eq!(config.typing_sweep, Duration::from_secs(1));
        assert!(config.presence_liveness > config.presence_heartbeat);
    }

    #[test]
    fn test_builders() {
        let config = SyncConfig::default()
            .with_max_retries(3)
            .with_presence(Duration::from_secs(1), Duration::from_secs(3));
        assert_eq!(config.max_retries, Some(3));
        assert_eq!(config.presence_heartbeat, Duration::from_secs(1));
        assert_eq!(config.presence_liveness, Duration::from_secs(3));
    }
}
