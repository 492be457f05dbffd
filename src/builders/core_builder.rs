//! Wires tracker, rate limiter, scheduler, dispatcher and admission pool.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::{CoreConfig, ElectionConfig};
use crate::core::admission_pool::{AdmissionPool, OutcomeSink, Spawn};
use crate::core::bulkhead::BulkheadScheduler;
use crate::core::dispatch::{CommandDispatcher, HandlerRegistry};
use crate::core::events::SharedEventSink;
use crate::core::master_job::MasterJobNegotiator;
use crate::core::resource_tracker::{RateLimiter, ResourceTracker};
use crate::core::SchedulerError;
use crate::infra::fabric::OutboundGate;
use crate::infra::queue::InMemoryPartitionQueue;

/// Name of the limiter attached to rate-limited levels.
pub const REQUEST_RATE_LIMITER: &str = "request";

/// Everything one service process needs, wired together.
pub struct ServiceCore<O, S> {
    /// Resource health tracker.
    pub tracker: Arc<ResourceTracker>,
    /// Limiter shared by every rate-limited level.
    pub rate_limiter: Arc<RateLimiter>,
    /// Bulkhead scheduler.
    pub scheduler: BulkheadScheduler,
    /// Handler registry; register handlers here after building.
    pub registry: Arc<HandlerRegistry>,
    /// Dispatcher running admitted units.
    pub dispatcher: Arc<CommandDispatcher>,
    /// Admission pool in front of the dispatcher.
    pub pool: AdmissionPool<InMemoryPartitionQueue, O, S>,
    /// Bulkhead admission for sends on the configured sender partitions.
    pub outbound: Arc<OutboundGate>,
    /// Event sink every component reports to.
    pub sink: SharedEventSink,
    election: ElectionConfig,
}

impl<O, S> std::fmt::Debug for ServiceCore<O, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCore")
            .field("scheduler", &self.scheduler)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<O, S> ServiceCore<O, S> {
    /// A negotiator for `command_id` using the configured election timing.
    #[must_use]
    pub fn negotiator(&self, command_id: &str, originator_id: &str) -> MasterJobNegotiator {
        MasterJobNegotiator::new(command_id, originator_id, self.election.clone())
    }
}

/// Validate `cfg` and build a [`ServiceCore`].
///
/// Levels that have at least one rate-limited listener or sender partition
/// get the shared [`REQUEST_RATE_LIMITER`], computed over
/// `cfg.rate_limit_profiles`.
///
/// # Errors
///
/// [`SchedulerError::InvalidConfig`] when the configuration does not
/// validate. Startup should abort on this error.
pub fn build_core<O, S>(
    cfg: &CoreConfig,
    spawner: S,
    outcomes: O,
    sink: SharedEventSink,
) -> Result<ServiceCore<O, S>, SchedulerError>
where
    O: OutcomeSink + 'static,
    S: Spawn + Clone + Send + Sync + 'static,
{
    build_core_with(cfg, spawner, |_| outcomes, sink)
}

/// Like [`build_core`], but the outcome sink is made from the core's
/// [`OutboundGate`], e.g. a
/// [`FabricOutcomeSink`](crate::infra::FabricOutcomeSink) whose responses
/// are admitted through it.
///
/// # Errors
///
/// As [`build_core`].
pub fn build_core_with<O, S, M>(
    cfg: &CoreConfig,
    spawner: S,
    make_outcomes: M,
    sink: SharedEventSink,
) -> Result<ServiceCore<O, S>, SchedulerError>
where
    O: OutcomeSink + 'static,
    S: Spawn + Clone + Send + Sync + 'static,
    M: FnOnce(&Arc<OutboundGate>) -> O,
{
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;

    let tracker = Arc::new(ResourceTracker::new(
        cfg.resource_tracker.clone(),
        Arc::clone(&sink),
    ));
    let profiles: Vec<&str> = cfg.rate_limit_profiles.iter().map(String::as_str).collect();
    let rate_limiter = tracker.register_request_rate_limiter(REQUEST_RATE_LIMITER, &profiles);

    let limited_levels: BTreeSet<usize> = cfg
        .channels
        .iter()
        .flat_map(|c| {
            let listeners = c
                .listener
                .iter()
                .filter(|p| p.supports_rate_limiting)
                .map(|p| p.priority);
            let senders = c
                .sender
                .iter()
                .filter(|p| p.supports_rate_limiting)
                .map(|p| p.priority);
            listeners.chain(senders)
        })
        .collect();
    let mut scheduler = BulkheadScheduler::new(cfg.scheduler.clone())?;
    for level in limited_levels {
        scheduler = scheduler.with_rate_limiter(level, Arc::clone(&rate_limiter))?;
    }

    let registry = Arc::new(HandlerRegistry::new());
    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::clone(&registry),
        cfg.exception_policy,
        Arc::clone(&sink),
    ));
    let outbound = Arc::new(OutboundGate::new(
        scheduler.clone(),
        &cfg.channels,
        cfg.max_parked_units,
    )?);
    let pool = AdmissionPool::new(
        scheduler.clone(),
        Arc::clone(&dispatcher),
        &cfg.channels,
        InMemoryPartitionQueue::new(cfg.max_parked_units),
        make_outcomes(&outbound),
        spawner,
        Arc::clone(&sink),
    )?;

    tracing::info!(
        channels = cfg.channels.len(),
        levels = scheduler.level_count(),
        policy = cfg.exception_policy.as_str(),
        "service core built"
    );

    Ok(ServiceCore {
        tracker,
        rate_limiter,
        scheduler,
        registry,
        dispatcher,
        pool,
        outbound,
        sink,
        election: cfg.election.clone(),
    })
}
