//! Resource health tracker settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sliding-window and curve parameters shared by every resource profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceTrackerConfig {
    /// Maximum outcomes kept per profile.
    pub window_size: usize,
    /// Outcomes older than this are evicted on the next read or write.
    pub window_age_ms: u64,
    /// Weight of an exception relative to a retry.
    pub exception_weight: f64,
    /// Retry ratio at or below which no throttling applies.
    pub low_water_ratio: f64,
    /// Retry ratio at or above which the circuit is fully open.
    pub cutout_ratio: f64,
}

impl Default for ResourceTrackerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            window_age_ms: 60_000,
            exception_weight: 2.0,
            low_water_ratio: 0.1,
            cutout_ratio: 0.5,
        }
    }
}

impl ResourceTrackerConfig {
    /// Window age as a duration.
    #[must_use]
    pub const fn window_age(&self) -> Duration {
        Duration::from_millis(self.window_age_ms)
    }

    /// Validate window bounds and curve thresholds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size == 0 {
            return Err("window_size must be greater than 0".into());
        }
        if self.window_age_ms == 0 {
            return Err("window_age_ms must be greater than 0".into());
        }
        if !self.exception_weight.is_finite() || self.exception_weight <= 0.0 {
            return Err(format!(
                "exception_weight must be a positive number, got {}",
                self.exception_weight
            ));
        }
        if !(0.0..1.0).contains(&self.low_water_ratio) {
            return Err(format!(
                "low_water_ratio must be in [0, 1), got {}",
                self.low_water_ratio
            ));
        }
        if self.cutout_ratio <= self.low_water_ratio || self.cutout_ratio > 1.0 {
            return Err(format!(
                "cutout_ratio ({}) must be above low_water_ratio ({}) and at most 1",
                self.cutout_ratio, self.low_water_ratio
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(ResourceTrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn cutout_must_exceed_low_water() {
        let cfg = ResourceTrackerConfig {
            low_water_ratio: 0.4,
            cutout_ratio: 0.4,
            ..ResourceTrackerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
