//! Listener and sender partition configuration.
//!
//! A partition is a priority-tagged lane within a channel. A bare priority,
//! from the constructor or from JSON, gets a weighting of 1.0 and rate
//! limiting only when it is level 0.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default upper bound on a unit's processing time.
pub const DEFAULT_MAX_PROCESSING_TIME_MS: u64 = 30_000;
/// Default fabric message lock duration.
pub const DEFAULT_FABRIC_MAX_MESSAGE_LOCK_MS: u64 = 60_000;

const fn default_weighting() -> f64 {
    1.0
}

const fn default_max_processing_time_ms() -> u64 {
    DEFAULT_MAX_PROCESSING_TIME_MS
}

const fn default_fabric_lock_ms() -> u64 {
    DEFAULT_FABRIC_MAX_MESSAGE_LOCK_MS
}

/// Inbound partition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ListenerPartitionFields")]
pub struct ListenerPartitionConfig {
    /// Priority level this partition's work is admitted under.
    pub priority: usize,
    /// Relative service frequency among partitions sharing a level.
    pub priority_weighting: f64,
    /// Whether admission is throttled by the resource rate limiter.
    pub supports_rate_limiting: bool,
    /// Upper bound before a unit is considered abandoned.
    pub max_processing_time_ms: u64,
    /// Lock duration the fabric grants a received message.
    pub fabric_max_message_lock_ms: u64,
}

/// Wire form of [`ListenerPartitionConfig`]; an absent
/// `supports_rate_limiting` resolves from the priority.
#[derive(Deserialize)]
struct ListenerPartitionFields {
    priority: usize,
    #[serde(default = "default_weighting")]
    priority_weighting: f64,
    #[serde(default)]
    supports_rate_limiting: Option<bool>,
    #[serde(default = "default_max_processing_time_ms")]
    max_processing_time_ms: u64,
    #[serde(default = "default_fabric_lock_ms")]
    fabric_max_message_lock_ms: u64,
}

impl From<ListenerPartitionFields> for ListenerPartitionConfig {
    fn from(fields: ListenerPartitionFields) -> Self {
        Self {
            priority: fields.priority,
            priority_weighting: fields.priority_weighting,
            supports_rate_limiting: fields
                .supports_rate_limiting
                .unwrap_or(fields.priority == 0),
            max_processing_time_ms: fields.max_processing_time_ms,
            fabric_max_message_lock_ms: fields.fabric_max_message_lock_ms,
        }
    }
}

impl ListenerPartitionConfig {
    /// Partition for a bare priority with default weighting and limits.
    #[must_use]
    pub const fn new(priority: usize) -> Self {
        Self {
            priority,
            priority_weighting: 1.0,
            supports_rate_limiting: priority == 0,
            max_processing_time_ms: DEFAULT_MAX_PROCESSING_TIME_MS,
            fabric_max_message_lock_ms: DEFAULT_FABRIC_MAX_MESSAGE_LOCK_MS,
        }
    }

    /// One default partition per priority, in the order given.
    #[must_use]
    pub fn init(priorities: &[usize]) -> Vec<Self> {
        priorities.iter().copied().map(Self::new).collect()
    }

    /// Set the weighting.
    #[must_use]
    pub const fn with_weighting(mut self, priority_weighting: f64) -> Self {
        self.priority_weighting = priority_weighting;
        self
    }

    /// Enable or disable rate limiting.
    #[must_use]
    pub const fn with_rate_limiting(mut self, supports_rate_limiting: bool) -> Self {
        self.supports_rate_limiting = supports_rate_limiting;
        self
    }

    /// Set the maximum processing time.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_max_processing_time(mut self, limit: Duration) -> Self {
        self.max_processing_time_ms = limit.as_millis() as u64;
        self
    }

    /// Set the fabric message lock.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_fabric_max_message_lock(mut self, lock: Duration) -> Self {
        self.fabric_max_message_lock_ms = lock.as_millis() as u64;
        self
    }

    /// Maximum processing time as a duration.
    #[must_use]
    pub const fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }

    /// Fabric lock as a duration.
    #[must_use]
    pub const fn fabric_max_message_lock(&self) -> Duration {
        Duration::from_millis(self.fabric_max_message_lock_ms)
    }

    /// How long a unit may wait for admission: the tighter of the two bounds.
    #[must_use]
    pub fn admission_deadline(&self) -> Duration {
        self.max_processing_time().min(self.fabric_max_message_lock())
    }

    /// Validate the partition settings.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if !self.priority_weighting.is_finite() || self.priority_weighting <= 0.0 {
            return Err(format!(
                "priority {} weighting must be a positive number, got {}",
                self.priority, self.priority_weighting
            ));
        }
        if self.max_processing_time_ms == 0 {
            return Err(format!(
                "priority {} max_processing_time_ms must be greater than 0",
                self.priority
            ));
        }
        if self.fabric_max_message_lock_ms == 0 {
            return Err(format!(
                "priority {} fabric_max_message_lock_ms must be greater than 0",
                self.priority
            ));
        }
        Ok(())
    }
}

/// Outbound partition settings. Sends on a configured partition are admitted
/// through the bulkhead at its priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SenderPartitionFields")]
pub struct SenderPartitionConfig {
    /// Priority stamped on outgoing units.
    pub priority: usize,
    /// Whether sends are throttled by the resource rate limiter.
    pub supports_rate_limiting: bool,
    /// How long a held send may wait for admission.
    pub fabric_max_message_lock_ms: u64,
}

#[derive(Deserialize)]
struct SenderPartitionFields {
    priority: usize,
    #[serde(default)]
    supports_rate_limiting: Option<bool>,
    #[serde(default = "default_fabric_lock_ms")]
    fabric_max_message_lock_ms: u64,
}

impl From<SenderPartitionFields> for SenderPartitionConfig {
    fn from(fields: SenderPartitionFields) -> Self {
        Self {
            priority: fields.priority,
            supports_rate_limiting: fields
                .supports_rate_limiting
                .unwrap_or(fields.priority == 0),
            fabric_max_message_lock_ms: fields.fabric_max_message_lock_ms,
        }
    }
}

impl SenderPartitionConfig {
    /// Partition for a bare priority with default settings.
    #[must_use]
    pub const fn new(priority: usize) -> Self {
        Self {
            priority,
            supports_rate_limiting: priority == 0,
            fabric_max_message_lock_ms: DEFAULT_FABRIC_MAX_MESSAGE_LOCK_MS,
        }
    }

    /// One default partition per priority, in the order given.
    #[must_use]
    pub fn init(priorities: &[usize]) -> Vec<Self> {
        priorities.iter().copied().map(Self::new).collect()
    }

    /// Opt in or out of rate limiting.
    #[must_use]
    pub const fn with_rate_limiting(mut self, supports_rate_limiting: bool) -> Self {
        self.supports_rate_limiting = supports_rate_limiting;
        self
    }

    /// Override the fabric lock.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_fabric_max_message_lock(mut self, lock: Duration) -> Self {
        self.fabric_max_message_lock_ms = lock.as_millis() as u64;
        self
    }

    /// Fabric lock as a duration.
    #[must_use]
    pub const fn fabric_max_message_lock(&self) -> Duration {
        Duration::from_millis(self.fabric_max_message_lock_ms)
    }
}

/// Listener and sender partitions of a single channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel identifier (matched case-insensitively).
    pub channel_id: String,
    /// Inbound partitions.
    #[serde(default)]
    pub listener: Vec<ListenerPartitionConfig>,
    /// Outbound partitions.
    #[serde(default)]
    pub sender: Vec<SenderPartitionConfig>,
}

impl ChannelConfig {
    /// Channel with default listener and sender partitions at the given priorities.
    #[must_use]
    pub fn with_priorities(channel_id: impl Into<String>, priorities: &[usize]) -> Self {
        Self {
            channel_id: channel_id.into(),
            listener: ListenerPartitionConfig::init(priorities),
            sender: SenderPartitionConfig::init(priorities),
        }
    }

    /// Validate partitions against the number of configured priority levels.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self, level_count: usize) -> Result<(), String> {
        if self.channel_id.trim().is_empty() {
            return Err("channel_id must not be empty".into());
        }
        for p in &self.listener {
            p.validate()
                .map_err(|e| format!("channel `{}` listener: {e}", self.channel_id))?;
            if p.priority >= level_count {
                return Err(format!(
                    "channel `{}` listener priority {} has no reserved level",
                    self.channel_id, p.priority
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.listener {
            if !seen.insert(p.priority) {
                return Err(format!(
                    "channel `{}` declares listener priority {} twice",
                    self.channel_id, p.priority
                ));
            }
        }
        if let Some(p) = self.sender.iter().find(|p| p.priority >= level_count) {
            return Err(format!(
                "channel `{}` sender priority {} has no reserved level",
                self.channel_id, p.priority
            ));
        }
        Ok(())
    }
}
