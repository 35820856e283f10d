//! Runtime configuration for the sync layer

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sync configuration
///
/// Every field has a default, so a partial TOML document is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Deadline for one remote commit, after which it is rolled back
    pub commit_timeout_ms: u64,
    /// Minimum spacing between outbound cursor broadcasts
    pub cursor_interval_ms: u64,
    /// Presence records older than this are pruned
    pub presence_ttl_ms: u64,
    /// First delay before retrying a failed resync
    pub resync_backoff_ms: u64,
    /// Upper bound for the doubling resync delay
    pub max_resync_backoff_ms: u64,
}

impl SyncConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With commit timeout
    #[inline]
    #[must_use]
    pub fn with_commit_timeout_ms(mut self, ms: u64) -> Self {
        self.commit_timeout_ms = ms;
        self
    }

    /// With cursor throttle interval
    #[inline]
    #[must_use]
    pub fn with_cursor_interval_ms(mut self, ms: u64) -> Self {
        self.cursor_interval_ms = ms;
        self
    }

    /// With presence expiry
    #[inline]
    #[must_use]
    pub fn with_presence_ttl_ms(mut self, ms: u64) -> Self {
        self.presence_ttl_ms = ms;
        self
    }

    /// With resync backoff bounds
    #[inline]
    #[must_use]
    pub fn with_resync_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.resync_backoff_ms = initial;
        self.max_resync_backoff_ms = max.max(initial);
        self
    }

    /// Commit deadline
    #[inline]
    #[must_use]
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    /// Cursor throttle interval
    #[inline]
    #[must_use]
    pub fn cursor_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_interval_ms)
    }

    /// Presence expiry
    #[inline]
    #[must_use]
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence_ttl_ms)
    }

    /// Delay before resync attempt number `attempt` (0-based), doubling and capped
    #[must_use]
    pub fn resync_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .resync_backoff_ms
            .saturating_mul(factor)
            .min(self.max_resync_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            commit_timeout_ms: 10_000,
            cursor_interval_ms: 50,
            presence_ttl_ms: 30_000,
            resync_backoff_ms: 250,
            max_resync_backoff_ms: 8_000,
        }
    }
}
