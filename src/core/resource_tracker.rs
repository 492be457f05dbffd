//! Resource health tracking and the rate limiter derived from it.
//!
//! Each [`ResourceProfile`] keeps a sliding window of outcomes bounded by
//! count and age. The retry ratio over that window is mapped through a
//! monotone decreasing curve to an adjustment in `[0, 1]`:
//!
//! ```text
//! adjustment
//!   1 |-------\
//!     |        \
//!   0 |         \_________
//!     +----+-----+--------- retry ratio
//!        low   cutout
//! ```
//!
//! The curve is evaluated lazily whenever a metric or a rate limiter is read.
//! Nothing here panics or returns an error: misuse of a token is counted and
//! logged.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::ResourceTrackerConfig;
use crate::core::events::{CoreEvent, ResourceEvent, ResourceEventKind, SharedEventSink};
use crate::util::clock::StartMark;

/// Final result of a unit of work against a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceRequestResult {
    /// The resource served the request.
    Success,
    /// The unit gave up after exhausting its retries.
    RetryExceeded,
    /// The unit timed out waiting on the resource.
    Timeout,
    /// The unit ended without reporting (scoped acquisition dropped).
    Abandoned,
}

impl ResourceRequestResult {
    /// True only for [`Self::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Opaque token tying a terminal call back to its `start`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceToken {
    id: u64,
    group: Arc<str>,
    correlation_id: Arc<str>,
}

impl ResourceToken {
    /// Consumer group supplied at `start`.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Correlation id supplied at `start`.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Returned by [`ResourceConsumer::start`].
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    /// Token to hand back to exactly one terminal call.
    pub token: ResourceToken,
    /// When the request started.
    pub start_mark: StartMark,
}

/// Read-only view of a profile's health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetric {
    /// Profile name.
    pub profile: String,
    /// Requests started and not yet terminated.
    pub active_count: i64,
    /// 1 means unrestricted, 0 means the circuit is fully open.
    pub rate_limit_adjustment_percentage: f64,
    /// Retry ratio at which the adjustment reaches 0.
    pub rate_limit_cutout_percentage: f64,
    /// `retry_sum / (successes + retry_sum)` over the window.
    pub retry_ratio: f64,
    /// Weighted retry and exception count over the window.
    pub retry_sum: f64,
    /// Successes over the window.
    pub successes: u64,
    /// Terminal calls made with unknown or already-consumed tokens.
    pub misuse_count: u64,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Retry,
    Exception,
}

#[derive(Debug, Default)]
struct OutcomeWindow {
    entries: VecDeque<(Instant, Outcome)>,
    successes: u64,
    retries: u64,
    exceptions: u64,
}

impl OutcomeWindow {
    fn push(&mut self, at: Instant, outcome: Outcome, max_len: usize) {
        while !self.entries.is_empty() && self.entries.len() >= max_len {
            self.pop_front();
        }
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Retry => self.retries += 1,
            Outcome::Exception => self.exceptions += 1,
        }
        self.entries.push_back((at, outcome));
    }

    fn evict_older_than(&mut self, now: Instant, max_age: Duration) {
        while let Some((at, _)) = self.entries.front() {
            if now.saturating_duration_since(*at) <= max_age {
                break;
            }
            self.pop_front();
        }
    }

    fn pop_front(&mut self) {
        if let Some((_, outcome)) = self.entries.pop_front() {
            match outcome {
                Outcome::Success => self.successes -= 1,
                Outcome::Retry => self.retries -= 1,
                Outcome::Exception => self.exceptions -= 1,
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn retry_sum(&self, exception_weight: f64) -> f64 {
        (self.exceptions as f64).mul_add(exception_weight, self.retries as f64)
    }
}

/// Map a retry ratio to an adjustment percentage.
///
/// Non-increasing in `retry_ratio`; exactly 1 at or below `low_water` and
/// exactly 0 at or above `cutout`.
#[must_use]
pub fn adjustment_for_ratio(retry_ratio: f64, low_water: f64, cutout: f64) -> f64 {
    if retry_ratio <= low_water {
        1.0
    } else if retry_ratio >= cutout {
        0.0
    } else {
        (1.0 - (retry_ratio - low_water) / (cutout - low_water)).clamp(0.0, 1.0)
    }
}

/// A named dependency whose health gates admission.
pub struct ResourceProfile {
    name: String,
    config: ResourceTrackerConfig,
    window: Mutex<OutcomeWindow>,
    outstanding: Mutex<HashSet<u64>>,
    active: AtomicI64,
    misuse: AtomicU64,
}

impl std::fmt::Debug for ResourceProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceProfile")
            .field("name", &self.name)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ResourceProfile {
    fn new(name: &str, config: ResourceTrackerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            window: Mutex::new(OutcomeWindow::default()),
            outstanding: Mutex::new(HashSet::new()),
            active: AtomicI64::new(0),
            misuse: AtomicU64::new(0),
        }
    }

    /// Profile name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests started and not yet terminated.
    #[must_use]
    pub fn active_count(&self) -> i64 {
        self.active.load(Ordering::Acquire)
    }

    /// Terminal calls rejected as misuse.
    #[must_use]
    pub fn misuse_count(&self) -> u64 {
        self.misuse.load(Ordering::Relaxed)
    }

    /// Current adjustment percentage.
    #[must_use]
    pub fn rate_limit_adjustment_percentage(&self) -> f64 {
        self.metric_at(Instant::now()).rate_limit_adjustment_percentage
    }

    /// Health snapshot evaluated now.
    #[must_use]
    pub fn metric(&self) -> ResourceMetric {
        self.metric_at(Instant::now())
    }

    fn metric_at(&self, now: Instant) -> ResourceMetric {
        let (successes, retry_sum) = {
            let mut window = self.window.lock();
            window.evict_older_than(now, self.config.window_age());
            (
                window.successes,
                window.retry_sum(self.config.exception_weight),
            )
        };
        #[allow(clippy::cast_precision_loss)]
        let denominator = successes as f64 + retry_sum;
        let retry_ratio = if denominator > 0.0 {
            retry_sum / denominator
        } else {
            0.0
        };
        ResourceMetric {
            profile: self.name.clone(),
            active_count: self.active_count(),
            rate_limit_adjustment_percentage: adjustment_for_ratio(
                retry_ratio,
                self.config.low_water_ratio,
                self.config.cutout_ratio,
            ),
            rate_limit_cutout_percentage: self.config.cutout_ratio,
            retry_ratio,
            retry_sum,
            successes,
            misuse_count: self.misuse_count(),
        }
    }

    fn record_at(&self, at: Instant, outcome: Outcome) {
        let mut window = self.window.lock();
        window.evict_older_than(at, self.config.window_age());
        window.push(at, outcome, self.config.window_size);
    }

    fn open(&self, id: u64) {
        self.outstanding.lock().insert(id);
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    fn is_outstanding(&self, id: u64) -> bool {
        self.outstanding.lock().contains(&id)
    }

    /// Close a token; false when it was unknown or already closed.
    fn close(&self, id: u64) -> bool {
        if self.outstanding.lock().remove(&id) {
            self.active.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    fn misused(&self, consumer: &str, token: &ResourceToken, call: &str) {
        let count = self.misuse.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            profile = %self.name,
            consumer,
            correlation_id = token.correlation_id(),
            call,
            misuse_count = count,
            "resource token is unknown or already terminated"
        );
    }
}

/// A named client of one profile. Obtained from [`ResourceTracker::register_consumer`].
pub struct ResourceConsumer {
    name: String,
    profile: Arc<ResourceProfile>,
    next_token: Arc<AtomicU64>,
    sink: SharedEventSink,
}

impl std::fmt::Debug for ResourceConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceConsumer")
            .field("name", &self.name)
            .field("profile", &self.profile.name)
            .finish_non_exhaustive()
    }
}

impl ResourceConsumer {
    /// Consumer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The profile this consumer reports against.
    #[must_use]
    pub const fn profile(&self) -> &Arc<ResourceProfile> {
        &self.profile
    }

    /// Begin consuming the resource.
    pub fn start(&self, group: &str, correlation_id: &str) -> ResourceRequest {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let token = ResourceToken {
            id,
            group: Arc::from(group),
            correlation_id: Arc::from(correlation_id),
        };
        self.profile.open(id);
        self.emit(&token, ResourceEventKind::Start, None, None);
        ResourceRequest {
            token,
            start_mark: StartMark::now(),
        }
    }

    /// Terminate a request with a result. A success counts toward the
    /// denominator; any other result counts as one retry.
    pub fn end(&self, token: &ResourceToken, start_mark: StartMark, result: ResourceRequestResult) {
        if !self.profile.close(token.id) {
            self.profile.misused(&self.name, token, "end");
            self.emit(token, ResourceEventKind::Misuse, None, None);
            return;
        }
        let (outcome, kind) = if result.is_success() {
            (Outcome::Success, ResourceEventKind::Success)
        } else {
            (Outcome::Retry, ResourceEventKind::Failed)
        };
        self.profile.record_at(Instant::now(), outcome);
        let reason = (!result.is_success()).then(|| format!("{result:?}"));
        self.emit(token, kind, Some(start_mark.elapsed().as_millis()), reason);
    }

    /// Record a retry against a still-open request. Not terminal.
    pub fn retry(&self, token: &ResourceToken, start_mark: StartMark, reason: &str) {
        if !self.profile.is_outstanding(token.id) {
            self.profile.misused(&self.name, token, "retry");
            self.emit(token, ResourceEventKind::Misuse, None, None);
            return;
        }
        self.profile.record_at(Instant::now(), Outcome::Retry);
        tracing::debug!(
            profile = %self.profile.name,
            consumer = %self.name,
            correlation_id = token.correlation_id(),
            reason,
            "resource retry"
        );
        self.emit(
            token,
            ResourceEventKind::Retry,
            Some(start_mark.elapsed().as_millis()),
            Some(reason.to_string()),
        );
    }

    /// Terminate a request because the resource failed outright.
    pub fn exception(&self, token: &ResourceToken, start_mark: StartMark) {
        if !self.profile.close(token.id) {
            self.profile.misused(&self.name, token, "exception");
            self.emit(token, ResourceEventKind::Misuse, None, None);
            return;
        }
        self.profile.record_at(Instant::now(), Outcome::Exception);
        self.emit(
            token,
            ResourceEventKind::Exception,
            Some(start_mark.elapsed().as_millis()),
            None,
        );
    }

    /// Scoped acquisition: the guard ends the request as
    /// [`ResourceRequestResult::Abandoned`] if dropped without a terminal call.
    #[must_use]
    pub fn begin(self: &Arc<Self>, group: &str, correlation_id: &str) -> ResourceGuard {
        ResourceGuard {
            request: Some(self.start(group, correlation_id)),
            consumer: Arc::clone(self),
        }
    }

    fn emit(
        &self,
        token: &ResourceToken,
        kind: ResourceEventKind,
        elapsed_ms: Option<u128>,
        reason: Option<String>,
    ) {
        self.sink.record(CoreEvent::Resource(ResourceEvent {
            profile: self.profile.name.clone(),
            consumer: self.name.clone(),
            group: token.group().to_string(),
            correlation_id: token.correlation_id().to_string(),
            kind,
            elapsed_ms,
            reason,
        }));
    }
}

/// Owns one started request and terminates it exactly once.
#[derive(Debug)]
pub struct ResourceGuard {
    consumer: Arc<ResourceConsumer>,
    request: Option<ResourceRequest>,
}

impl ResourceGuard {
    /// Token of the guarded request.
    #[must_use]
    pub fn token(&self) -> Option<&ResourceToken> {
        self.request.as_ref().map(|r| &r.token)
    }

    /// Record a retry; the request stays open.
    pub fn retry(&self, reason: &str) {
        if let Some(req) = &self.request {
            self.consumer.retry(&req.token, req.start_mark, reason);
        }
    }

    /// End with [`ResourceRequestResult::Success`].
    pub fn success(self) {
        self.end(ResourceRequestResult::Success);
    }

    /// End with the given result.
    pub fn end(mut self, result: ResourceRequestResult) {
        if let Some(req) = self.request.take() {
            self.consumer.end(&req.token, req.start_mark, result);
        }
    }

    /// End as an exception.
    pub fn exception(mut self) {
        if let Some(req) = self.request.take() {
            self.consumer.exception(&req.token, req.start_mark);
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Some(req) = self.request.take() {
            self.consumer
                .end(&req.token, req.start_mark, ResourceRequestResult::Abandoned);
        }
    }
}

/// Most-restrictive-wins composition over several profiles.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    profiles: Vec<Arc<ResourceProfile>>,
}

impl RateLimiter {
    /// Limiter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Minimum adjustment across the combined profiles; 1.0 when there are none.
    #[must_use]
    pub fn rate_limit_adjustment_percentage(&self) -> f64 {
        self.profiles
            .iter()
            .map(|p| p.rate_limit_adjustment_percentage())
            .fold(1.0, f64::min)
    }
}

/// Registry of profiles, consumers and rate limiters for one process.
pub struct ResourceTracker {
    config: ResourceTrackerConfig,
    profiles: RwLock<HashMap<String, Arc<ResourceProfile>>>,
    consumers: RwLock<HashMap<String, Arc<ResourceConsumer>>>,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    next_token: Arc<AtomicU64>,
    sink: SharedEventSink,
}

impl ResourceTracker {
    /// Create a tracker reporting to `sink`.
    #[must_use]
    pub fn new(config: ResourceTrackerConfig, sink: SharedEventSink) -> Self {
        Self {
            config,
            profiles: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            limiters: RwLock::new(HashMap::new()),
            next_token: Arc::new(AtomicU64::new(1)),
            sink,
        }
    }

    /// Get or create a profile.
    pub fn profile(&self, name: &str) -> Arc<ResourceProfile> {
        if let Some(p) = self.profiles.read().get(name) {
            return Arc::clone(p);
        }
        let mut profiles = self.profiles.write();
        Arc::clone(
            profiles
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ResourceProfile::new(name, self.config.clone()))),
        )
    }

    /// Register a consumer. Idempotent per name: a second registration
    /// returns the existing consumer unchanged.
    pub fn register_consumer(&self, name: &str, profile: &str) -> Arc<ResourceConsumer> {
        if let Some(c) = self.consumers.read().get(name) {
            return Arc::clone(c);
        }
        let profile = self.profile(profile);
        let mut consumers = self.consumers.write();
        let consumer = consumers.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(consumer = name, profile = %profile.name, "registered resource consumer");
            Arc::new(ResourceConsumer {
                name: name.to_string(),
                profile,
                next_token: Arc::clone(&self.next_token),
                sink: Arc::clone(&self.sink),
            })
        });
        Arc::clone(consumer)
    }

    /// Register a rate limiter over the named profiles.
    pub fn register_request_rate_limiter(&self, name: &str, profiles: &[&str]) -> Arc<RateLimiter> {
        if let Some(l) = self.limiters.read().get(name) {
            return Arc::clone(l);
        }
        let resolved = profiles.iter().map(|p| self.profile(p)).collect();
        let mut limiters = self.limiters.write();
        Arc::clone(limiters.entry(name.to_string()).or_insert_with(|| {
            Arc::new(RateLimiter {
                name: name.to_string(),
                profiles: resolved,
            })
        }))
    }

    /// Health snapshot of a profile, if it exists.
    #[must_use]
    pub fn metric(&self, profile: &str) -> Option<ResourceMetric> {
        self.profiles.read().get(profile).map(|p| p.metric())
    }

    /// Health snapshots of every profile.
    #[must_use]
    pub fn metrics(&self) -> Vec<ResourceMetric> {
        self.profiles.read().values().map(|p| p.metric()).collect()
    }
}
