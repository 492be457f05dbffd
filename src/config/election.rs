//! Master-job election timing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing of the master-job negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Interval between coordinator ticks; an Active instance heartbeats once per tick.
    pub heartbeat_interval_ms: u64,
    /// Ticks a Standby tolerates without hearing from the leader.
    pub missed_heartbeat_threshold: u32,
    /// Ticks spent collecting competing requests before deciding.
    pub request_rounds: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            missed_heartbeat_threshold: 3,
            request_rounds: 2,
        }
    }
}

impl ElectionConfig {
    /// Heartbeat interval as a duration.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Validate thresholds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than 0".into());
        }
        if self.missed_heartbeat_threshold < 2 {
            return Err(format!(
                "missed_heartbeat_threshold must be at least 2, got {}",
                self.missed_heartbeat_threshold
            ));
        }
        if self.request_rounds == 0 {
            return Err("request_rounds must be greater than 0".into());
        }
        Ok(())
    }
}
