//! Priority bulkhead scheduler.
//!
//! Counts active units per priority level and globally with atomics, and
//! decides admission from those counters plus the level's rate limiter.
//! Reservations are taken under one short admission lock so a verdict and the
//! counter increments it allows are a single step; reads and releases stay
//! lock-free. A slot is held by a [`SlotPermit`] and released when the permit
//! drops.
//!
//! Admission order for a level `L`:
//!
//! 1. `L` is rate limited and its adjustment is 0: defer (circuit open).
//! 2. Global active is below `concurrent_requests_min`: admit.
//! 3. `L` is at its burst ceiling (scaled by the adjustment when rate
//!    limited): defer.
//! 4. `L` is below its reserved minimum: admit, even past the global
//!    ceiling. The overshoot is bounded by the sum of reserved minimums.
//! 5. Global active is at `concurrent_requests_max`: defer.
//! 6. `L` is borrowing and the free slots would not cover the unmet
//!    reservations of other levels that have demand (or are hard
//!    bulkheads): defer.
//! 7. Otherwise admit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::{PriorityLevelReservation, SchedulerConfig};
use crate::core::error::SchedulerError;
use crate::core::resource_tracker::RateLimiter;

/// Upper bound between re-checks while waiting for a slot. Guards against a
/// missed notification when demand changes without a release.
const WAIT_RECHECK: Duration = Duration::from_millis(50);

/// Why a unit was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    /// The level's rate limiter reports adjustment 0.
    CircuitOpen,
    /// The level's ceiling, scaled by the rate limiter, is reached.
    RateLimited,
    /// The level is at its burst ceiling.
    LevelSaturated,
    /// The global ceiling is reached.
    CapacityExhausted,
    /// Free slots are held for another level's unmet reservation.
    ReservedForOtherLevel,
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionVerdict {
    /// A slot is available.
    Admit,
    /// Not now; the unit should be re-queued.
    Defer(DeferReason),
}

impl AdmissionVerdict {
    /// True for [`Self::Admit`].
    #[must_use]
    pub const fn is_admit(self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Counters of one level at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSnapshot {
    /// Priority level.
    pub level: usize,
    /// Units running at this level.
    pub active: usize,
    /// Callers currently waiting in [`BulkheadScheduler::acquire`] or
    /// registered through [`BulkheadScheduler::add_demand`].
    pub waiting: usize,
    /// Guaranteed slots.
    pub reserved_minimum: usize,
    /// Burst ceiling.
    pub reserved_maximum: usize,
    /// Current rate limit adjustment, when a limiter is attached.
    pub rate_limit_adjustment: Option<f64>,
}

/// Counters of the whole scheduler at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Units running across all levels.
    pub global_active: usize,
    /// Liveness floor.
    pub concurrent_requests_min: usize,
    /// Global ceiling.
    pub concurrent_requests_max: usize,
    /// Per-level counters.
    pub levels: Vec<LevelSnapshot>,
}

struct LevelState {
    reservation: PriorityLevelReservation,
    active: AtomicUsize,
    waiting: AtomicUsize,
    limiter: Option<Arc<RateLimiter>>,
}

struct Shared {
    min: usize,
    max: usize,
    global: AtomicUsize,
    levels: Vec<LevelState>,
    admit: Mutex<()>,
    released: Notify,
}

/// Admits units of work against per-level reservations and a shared ceiling.
///
/// Cheap to clone; clones share counters.
#[derive(Clone)]
pub struct BulkheadScheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for BulkheadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadScheduler")
            .field("global_active", &self.global_active())
            .field("levels", &self.shared.levels.len())
            .finish_non_exhaustive()
    }
}

impl BulkheadScheduler {
    /// Validate the configuration and create a scheduler.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] when the reservations are malformed.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let mut reservations = config.reservations;
        reservations.sort_by_key(|r| r.level);
        let levels = reservations
            .into_iter()
            .map(|reservation| LevelState {
                reservation,
                active: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                limiter: None,
            })
            .collect();
        Ok(Self {
            shared: Arc::new(Shared {
                min: config.concurrent_requests_min,
                max: config.concurrent_requests_max,
                global: AtomicUsize::new(0),
                levels,
                admit: Mutex::new(()),
                released: Notify::new(),
            }),
        })
    }

    /// Attach a rate limiter to a level. Must be called before the scheduler
    /// is cloned or shared.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownPriorityLevel`] for a level without a
    /// reservation, [`SchedulerError::Backend`] when the scheduler is already
    /// shared.
    pub fn with_rate_limiter(
        mut self,
        level: usize,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, SchedulerError> {
        let shared = Arc::get_mut(&mut self.shared).ok_or_else(|| {
            SchedulerError::Backend("rate limiters must be attached before sharing".into())
        })?;
        let state = shared
            .levels
            .get_mut(level)
            .ok_or(SchedulerError::UnknownPriorityLevel(level))?;
        state.limiter = Some(limiter);
        Ok(self)
    }

    /// Number of configured levels.
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.shared.levels.len()
    }

    /// Units running across all levels.
    #[must_use]
    pub fn global_active(&self) -> usize {
        self.shared.global.load(Ordering::Acquire)
    }

    /// Units running at `level`, or `None` for an unknown level.
    #[must_use]
    pub fn level_active(&self, level: usize) -> Option<usize> {
        self.shared
            .levels
            .get(level)
            .map(|l| l.active.load(Ordering::Acquire))
    }

    /// Non-blocking admission check. Does not reserve anything.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownPriorityLevel`].
    pub fn evaluate(
        &self,
        level: usize,
        supports_rate_limiting: bool,
    ) -> Result<AdmissionVerdict, SchedulerError> {
        let state = self.level(level)?;
        Ok(self.verdict(
            level,
            state,
            supports_rate_limiting,
            self.global_active(),
        ))
    }

    /// Reserve a slot if the level is admitted right now.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownPriorityLevel`].
    pub fn try_admit(
        &self,
        level: usize,
        supports_rate_limiting: bool,
    ) -> Result<Option<SlotPermit>, SchedulerError> {
        let state = self.level(level)?;
        let _admitting = self.shared.admit.lock();
        let global = self.shared.global.load(Ordering::Acquire);
        if !self
            .verdict(level, state, supports_rate_limiting, global)
            .is_admit()
        {
            return Ok(None);
        }
        self.shared.global.fetch_add(1, Ordering::AcqRel);
        state.active.fetch_add(1, Ordering::AcqRel);
        Ok(Some(SlotPermit {
            shared: Arc::clone(&self.shared),
            level,
        }))
    }

    /// Wait for a slot, registering demand at `level` while waiting.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::AdmissionTimeout`] once `timeout` elapses,
    /// [`SchedulerError::UnknownPriorityLevel`] for an unknown level.
    pub async fn acquire(
        &self,
        level: usize,
        supports_rate_limiting: bool,
        timeout: Duration,
    ) -> Result<SlotPermit, SchedulerError> {
        if let Some(permit) = self.try_admit(level, supports_rate_limiting)? {
            return Ok(permit);
        }
        let started = Instant::now();
        let _demand = self.add_demand(level)?;
        tracing::debug!(level, "waiting for admission");

        let wait = async {
            loop {
                let released = self.shared.released.notified();
                if let Some(permit) = self.try_admit(level, supports_rate_limiting)? {
                    return Ok(permit);
                }
                let _ = tokio::time::timeout(WAIT_RECHECK, released).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                let waited_ms = started.elapsed().as_millis();
                tracing::debug!(level, waited_ms, "admission wait timed out");
                Err(SchedulerError::AdmissionTimeout { level, waited_ms })
            }
        }
    }

    /// Register demand at `level` for as long as the returned guard lives.
    ///
    /// Demand makes the level's unmet reservation count against borrowers.
    /// Parked units that are not waiting in [`Self::acquire`] use this.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownPriorityLevel`].
    pub fn add_demand(&self, level: usize) -> Result<DemandGuard, SchedulerError> {
        self.level(level)?.waiting.fetch_add(1, Ordering::AcqRel);
        Ok(DemandGuard {
            shared: Arc::clone(&self.shared),
            level,
        })
    }

    /// Current counters.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            global_active: self.global_active(),
            concurrent_requests_min: self.shared.min,
            concurrent_requests_max: self.shared.max,
            levels: self
                .shared
                .levels
                .iter()
                .map(|l| LevelSnapshot {
                    level: l.reservation.level,
                    active: l.active.load(Ordering::Acquire),
                    waiting: l.waiting.load(Ordering::Acquire),
                    reserved_minimum: l.reservation.reserved_minimum,
                    reserved_maximum: l.reservation.reserved_maximum,
                    rate_limit_adjustment: l
                        .limiter
                        .as_ref()
                        .map(|r| r.rate_limit_adjustment_percentage()),
                })
                .collect(),
        }
    }

    fn level(&self, level: usize) -> Result<&LevelState, SchedulerError> {
        self.shared
            .levels
            .get(level)
            .ok_or(SchedulerError::UnknownPriorityLevel(level))
    }

    fn verdict(
        &self,
        level: usize,
        state: &LevelState,
        supports_rate_limiting: bool,
        global: usize,
    ) -> AdmissionVerdict {
        let adjustment = if supports_rate_limiting {
            state
                .limiter
                .as_ref()
                .map(|l| l.rate_limit_adjustment_percentage())
        } else {
            None
        };
        if adjustment.is_some_and(|a| a <= 0.0) {
            return AdmissionVerdict::Defer(DeferReason::CircuitOpen);
        }
        if global < self.shared.min {
            return AdmissionVerdict::Admit;
        }

        let active = state.active.load(Ordering::Acquire);
        let r = &state.reservation;
        let ceiling = adjustment.map_or(r.reserved_maximum, |a| scaled_limit(r.reserved_maximum, a));
        if active >= ceiling {
            let reason = if ceiling < r.reserved_maximum {
                DeferReason::RateLimited
            } else {
                DeferReason::LevelSaturated
            };
            return AdmissionVerdict::Defer(reason);
        }
        if active < r.reserved_minimum {
            return AdmissionVerdict::Admit;
        }
        if global >= self.shared.max {
            return AdmissionVerdict::Defer(DeferReason::CapacityExhausted);
        }

        let free = self.shared.max - global;
        let held_for_others: usize = self
            .shared
            .levels
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != level)
            .map(|(_, other)| other.unmet_reservation())
            .sum();
        if free <= held_for_others {
            return AdmissionVerdict::Defer(DeferReason::ReservedForOtherLevel);
        }
        AdmissionVerdict::Admit
    }
}

impl LevelState {
    /// Reserved slots this level has not yet used and still needs.
    fn unmet_reservation(&self) -> usize {
        let r = &self.reservation;
        let claims = r.is_hard_bulkhead() || self.waiting.load(Ordering::Acquire) > 0;
        if claims {
            r.reserved_minimum
                .saturating_sub(self.active.load(Ordering::Acquire))
        } else {
            0
        }
    }
}

/// Slots available to a rate-limited level: the ceiling scaled by the
/// adjustment, rounded up so any positive adjustment leaves at least one.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn scaled_limit(reserved_maximum: usize, adjustment: f64) -> usize {
    if adjustment <= 0.0 {
        return 0;
    }
    let scaled = (reserved_maximum as f64 * adjustment.min(1.0)).ceil() as usize;
    scaled.clamp(1, reserved_maximum)
}

/// A held execution slot. Dropping it releases the slot and wakes waiters.
#[must_use = "dropping a permit releases the slot immediately"]
pub struct SlotPermit {
    shared: Arc<Shared>,
    level: usize,
}

impl SlotPermit {
    /// Level the slot belongs to.
    #[must_use]
    pub const fn level(&self) -> usize {
        self.level
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").field("level", &self.level).finish()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(level) = self.shared.levels.get(self.level) {
            level.active.fetch_sub(1, Ordering::AcqRel);
        }
        self.shared.global.fetch_sub(1, Ordering::AcqRel);
        self.shared.released.notify_waiters();
    }
}

/// Registered demand at a level; removed on drop.
pub struct DemandGuard {
    shared: Arc<Shared>,
    level: usize,
}

impl std::fmt::Debug for DemandGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemandGuard").field("level", &self.level).finish()
    }
}

impl Drop for DemandGuard {
    fn drop(&mut self) {
        if let Some(level) = self.shared.levels.get(self.level) {
            level.waiting.fetch_sub(1, Ordering::AcqRel);
        }
        self.shared.released.notify_waiters();
    }
}

/// Smooth weighted round-robin over partitions sharing a level.
///
/// Each selection adds every ready candidate's weight to its running score,
/// picks the highest score and subtracts the total ready weight from it. Over
/// time each candidate is picked in proportion to its weight, without bursts.
#[derive(Debug, Clone, Default)]
pub struct WeightedRoundRobin {
    weights: Vec<f64>,
    current: Vec<f64>,
}

impl WeightedRoundRobin {
    /// Create a selector over the given weights. Non-positive weights are
    /// never selected.
    #[must_use]
    pub fn new(weights: Vec<f64>) -> Self {
        let current = vec![0.0; weights.len()];
        Self { weights, current }
    }

    /// Add a candidate and return its index.
    pub fn push(&mut self, weight: f64) -> usize {
        self.weights.push(weight);
        self.current.push(0.0);
        self.weights.len() - 1
    }

    /// Number of candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// True when there are no candidates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Select the next candidate among those whose index is in `ready`.
    pub fn select(&mut self, ready: &[usize]) -> Option<usize> {
        let mut total = 0.0;
        let mut best: Option<usize> = None;
        for &i in ready {
            let Some(&w) = self.weights.get(i) else {
                continue;
            };
            if w <= 0.0 || !w.is_finite() {
                continue;
            }
            self.current[i] += w;
            total += w;
            if best.is_none_or(|b| self.current[i] > self.current[b]) {
                best = Some(i);
            }
        }
        let chosen = best?;
        self.current[chosen] -= total;
        Some(chosen)
    }
}
