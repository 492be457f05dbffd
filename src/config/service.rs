//! Root configuration handed to the core by the hosting service.

use serde::{Deserialize, Serialize};

use super::{ChannelConfig, ElectionConfig, ResourceTrackerConfig, SchedulerConfig};
use crate::core::dispatch::ExceptionPolicy;

/// Already-resolved settings for one service process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Bulkhead ceilings and per-level reservations.
    pub scheduler: SchedulerConfig,
    /// Resource health window and curve.
    pub resource_tracker: ResourceTrackerConfig,
    /// Master-job negotiation timing.
    pub election: ElectionConfig,
    /// Channels and their partitions.
    pub channels: Vec<ChannelConfig>,
    /// What the dispatcher does when a handler fails.
    pub exception_policy: ExceptionPolicy,
    /// Units the admission pool may hold parked at once.
    pub max_parked_units: usize,
    /// Resource profiles whose health throttles rate-limited partitions.
    pub rate_limit_profiles: Vec<String>,
}

/// Default cap on parked units.
pub const DEFAULT_MAX_PARKED_UNITS: usize = 10_000;

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            resource_tracker: ResourceTrackerConfig::default(),
            election: ElectionConfig::default(),
            channels: Vec::new(),
            exception_policy: ExceptionPolicy::default(),
            max_parked_units: DEFAULT_MAX_PARKED_UNITS,
            rate_limit_profiles: Vec::new(),
        }
    }
}

impl CoreConfig {
    /// Append a channel.
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channels.push(channel);
        self
    }

    /// Set the exception policy.
    #[must_use]
    pub const fn with_exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.exception_policy = policy;
        self
    }

    /// Validate every section and cross-check partitions against levels.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint, prefixed with
    /// the section it came from.
    pub fn validate(&self) -> Result<(), String> {
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler: {e}"))?;
        self.resource_tracker
            .validate()
            .map_err(|e| format!("resource_tracker: {e}"))?;
        self.election
            .validate()
            .map_err(|e| format!("election: {e}"))?;
        if self.max_parked_units == 0 {
            return Err("max_parked_units must be > 0".into());
        }

        let levels = self.scheduler.level_count();
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            channel.validate(levels)?;
            if !seen.insert(channel.channel_id.to_lowercase()) {
                return Err(format!(
                    "channel `{}` is configured more than once",
                    channel.channel_id
                ));
            }
        }
        Ok(())
    }

    /// Parse from JSON and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
