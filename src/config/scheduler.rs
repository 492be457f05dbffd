//! Bulkhead scheduler configuration: global ceilings and per-level reservations.

use serde::{Deserialize, Serialize};

/// Concurrency reserved for a single priority level.
///
/// Level 0 is the highest priority. `reserved_minimum` slots are guaranteed
/// to the level whenever it has demand; `reserved_maximum` is its burst
/// ceiling. A level whose minimum equals its maximum is a hard bulkhead: it
/// never borrows and never lends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityLevelReservation {
    /// Priority level, contiguous from 0.
    pub level: usize,
    /// Slots guaranteed to this level under load.
    pub reserved_minimum: usize,
    /// Burst ceiling for this level.
    pub reserved_maximum: usize,
}

impl PriorityLevelReservation {
    /// Create a reservation.
    #[must_use]
    pub const fn new(level: usize, reserved_minimum: usize, reserved_maximum: usize) -> Self {
        Self {
            level,
            reserved_minimum,
            reserved_maximum,
        }
    }

    /// True when the level neither borrows nor lends capacity.
    #[must_use]
    pub const fn is_hard_bulkhead(&self) -> bool {
        self.reserved_minimum == self.reserved_maximum
    }
}

/// Scheduler-wide concurrency settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Below this many active units everything is admitted (liveness floor).
    pub concurrent_requests_min: usize,
    /// Global ceiling for opportunistic admission.
    pub concurrent_requests_max: usize,
    /// One reservation per priority level.
    pub reservations: Vec<PriorityLevelReservation>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let max = (num_cpus::get() * 4).max(4);
        Self {
            concurrent_requests_min: 1,
            concurrent_requests_max: max,
            reservations: vec![
                PriorityLevelReservation::new(0, 1, max),
                PriorityLevelReservation::new(1, 1, max),
                PriorityLevelReservation::new(2, 0, max),
            ],
        }
    }
}

impl SchedulerConfig {
    /// Start a configuration with the given floor and ceiling and no levels.
    #[must_use]
    pub const fn new(concurrent_requests_min: usize, concurrent_requests_max: usize) -> Self {
        Self {
            concurrent_requests_min,
            concurrent_requests_max,
            reservations: Vec::new(),
        }
    }

    /// Append the next priority level.
    #[must_use]
    pub fn with_level(mut self, reserved_minimum: usize, reserved_maximum: usize) -> Self {
        let level = self.reservations.len();
        self.reservations.push(PriorityLevelReservation::new(
            level,
            reserved_minimum,
            reserved_maximum,
        ));
        self
    }

    /// Number of configured priority levels.
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.reservations.len()
    }

    /// Validate ceilings and reservations.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrent_requests_max == 0 {
            return Err("concurrent_requests_max must be greater than 0".into());
        }
        if self.concurrent_requests_min > self.concurrent_requests_max {
            return Err(format!(
                "concurrent_requests_min ({}) exceeds concurrent_requests_max ({})",
                self.concurrent_requests_min, self.concurrent_requests_max
            ));
        }
        if self.reservations.is_empty() {
            return Err("at least one priority level must be reserved".into());
        }

        let mut levels: Vec<usize> = self.reservations.iter().map(|r| r.level).collect();
        levels.sort_unstable();
        if levels.iter().enumerate().any(|(i, level)| i != *level) {
            return Err(format!(
                "priority levels must be contiguous from 0, got {levels:?}"
            ));
        }

        let mut reserved_total = 0usize;
        for r in &self.reservations {
            if r.reserved_maximum == 0 {
                return Err(format!("level {} reserved_maximum must be greater than 0", r.level));
            }
            if r.reserved_minimum > r.reserved_maximum {
                return Err(format!(
                    "level {} reserved_minimum ({}) exceeds reserved_maximum ({})",
                    r.level, r.reserved_minimum, r.reserved_maximum
                ));
            }
            if r.reserved_maximum > self.concurrent_requests_max {
                return Err(format!(
                    "level {} reserved_maximum ({}) exceeds concurrent_requests_max ({})",
                    r.level, r.reserved_maximum, self.concurrent_requests_max
                ));
            }
            reserved_total += r.reserved_minimum;
        }
        if reserved_total > self.concurrent_requests_max {
            return Err(format!(
                "sum of reserved minimums ({reserved_total}) exceeds concurrent_requests_max ({})",
                self.concurrent_requests_max
            ));
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_gap_in_levels() {
        let mut cfg = SchedulerConfig::new(0, 10).with_level(1, 5);
        cfg.reservations
            .push(PriorityLevelReservation::new(2, 1, 5));
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("contiguous"), "{err}");
    }

    #[test]
    fn rejects_reservations_over_ceiling() {
        let cfg = SchedulerConfig::new(0, 4).with_level(3, 4).with_level(2, 4);
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("sum of reserved minimums"), "{err}");
    }

    #[test]
    fn hard_bulkhead_flag() {
        assert!(PriorityLevelReservation::new(0, 2, 2).is_hard_bulkhead());
        assert!(!PriorityLevelReservation::new(0, 1, 2).is_hard_bulkhead());
    }
}
