//! Engine timing constants and configuration.

use std::time::Duration;

/// Quiet period before a requested reload actually runs.
pub const RELOAD_DEBOUNCE_MS: u64 = 600;

/// First reconnect delay after the push connection fails.
pub const PUSH_BACKOFF_INITIAL_SECS: u64 = 2;

/// Upper bound for the reconnect delay.
pub const PUSH_BACKOFF_MAX_SECS: u64 = 30;

/// Polling cadence used when no push transport is available.
pub const POLL_FALLBACK_INTERVAL_SECS: u64 = 10;

/// Reason recorded on a resource while an optimistic edit is in flight.
pub const EDIT_IN_FLIGHT_REASON: &str = "edit in flight";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub reload_debounce: Duration,
    pub push_backoff_initial: Duration,
    pub push_backoff_max: Duration,
    pub poll_interval: Duration,
    /// Periodic non-forced reload of every tracked resource, if set.
    pub auto_refresh_interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reload_debounce: Duration::from_millis(RELOAD_DEBOUNCE_MS),
            push_backoff_initial: Duration::from_secs(PUSH_BACKOFF_INITIAL_SECS),
            push_backoff_max: Duration::from_secs(PUSH_BACKOFF_MAX_SECS),
            poll_interval: Duration::from_secs(POLL_FALLBACK_INTERVAL_SECS),
            auto_refresh_interval: None,
        }
    }
}

impl SyncConfig {
    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.push_backoff_initial.is_zero() {
            return Err(crate::SyncError::config("push backoff must be positive"));
        }
        if self.push_backoff_max < self.push_backoff_initial {
            return Err(crate::SyncError::config(
                "push backoff cap is below the initial delay",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(crate::SyncError::config("poll interval must be positive"));
        }
        if self.auto_refresh_interval.is_some_and(|d| d.is_zero()) {
            return Err(crate::SyncError::config(
                "auto refresh interval must be positive",
            ));
        }
        Ok(())
    }
}
