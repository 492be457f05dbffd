//! Admission pool: the parking lot in front of the dispatcher.
//!
//! A submitted unit runs immediately when the bulkhead admits it; otherwise it
//! is parked in its partition until a slot frees up or its deadline passes.
//! Parked units register demand at their level, so borrowers leave room for
//! them. When a unit finishes its permit is released, its outcome is
//! delivered, and parked work is woken highest level first, weighted
//! round-robin across partitions within a level.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{ChannelConfig, ListenerPartitionConfig};
use crate::core::bulkhead::{
    AdmissionVerdict, BulkheadScheduler, DemandGuard, SlotPermit, WeightedRoundRobin,
};
use crate::core::dispatch::{CommandDispatcher, DispatchOutcome, TransmissionUnit};
use crate::core::error::SchedulerError;
use crate::core::events::{CoreEvent, SharedEventSink};

/// Abstraction for spawning work on a runtime.
pub trait Spawn {
    /// Spawn a future to run to completion in the background.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Where a submitted unit ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    /// Admitted and running.
    Running,
    /// Parked until a slot frees up.
    Parked,
}

/// Final disposition of a unit, reported to its originator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    /// The dispatcher ran the unit.
    Dispatched(DispatchOutcome),
    /// The dispatcher returned an error (unresolved or re-thrown).
    Rejected(String),
    /// The unit was never admitted before its deadline.
    TimedOut {
        /// Milliseconds between creation and expiry.
        waited_ms: u128,
    },
}

/// Outcome of one unit plus any responses its handler produced.
#[derive(Debug, Clone)]
pub struct UnitReport {
    /// The unit, with its signal set by the dispatcher.
    pub unit: TransmissionUnit,
    /// What happened.
    pub outcome: UnitOutcome,
    /// Responses produced by the handler or the exception policy.
    pub responses: Vec<TransmissionUnit>,
}

/// Receives the final report for every submitted unit.
pub trait OutcomeSink: Send + Sync {
    /// Deliver a report. Must not block.
    fn deliver(&self, report: UnitReport);

    /// Retry work the sink held back, e.g. responses waiting for outbound
    /// admission. Returns how many went out.
    fn flush(&self, _now_ms: u128) -> usize {
        0
    }
}

impl<T: OutcomeSink + ?Sized> OutcomeSink for Arc<T> {
    fn deliver(&self, report: UnitReport) {
        (**self).deliver(report);
    }

    fn flush(&self, now_ms: u128) -> usize {
        (**self).flush(now_ms)
    }
}

/// A unit waiting for admission.
#[derive(Debug)]
pub struct ParkedUnit {
    /// The waiting unit.
    pub unit: TransmissionUnit,
    /// Index of its partition in the pool's partition table.
    pub partition: usize,
    /// Absolute deadline in milliseconds since the epoch.
    pub deadline_ms: u128,
    demand: Option<DemandGuard>,
}

impl ParkedUnit {
    /// Create a parked entry. `demand` keeps the level's reservation claimed
    /// while the unit waits.
    #[must_use]
    pub const fn new(
        unit: TransmissionUnit,
        partition: usize,
        deadline_ms: u128,
        demand: Option<DemandGuard>,
    ) -> Self {
        Self {
            unit,
            partition,
            deadline_ms,
            demand,
        }
    }

    /// True once `now_ms` is past the deadline.
    #[must_use]
    pub const fn is_expired(&self, now_ms: u128) -> bool {
        now_ms > self.deadline_ms
    }
}

/// Storage for parked units, one FIFO lane per partition.
pub trait PartitionQueue {
    /// Park a unit at the back of its partition.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::QueueFull`] when the queue is at capacity.
    fn park(&mut self, parked: ParkedUnit) -> Result<(), SchedulerError>;
    /// Put a unit back at the front of its partition.
    fn restore(&mut self, parked: ParkedUnit);
    /// Take the oldest unit of a partition.
    fn take(&mut self, partition: usize) -> Option<ParkedUnit>;
    /// Partitions that have parked work.
    fn ready(&self) -> Vec<usize>;
    /// Remove and return every unit past its deadline.
    fn prune_expired(&mut self, now_ms: u128) -> Vec<ParkedUnit>;
    /// Maximum number of parked units.
    fn max_depth(&self) -> usize;
    /// Number of parked units.
    fn len(&self) -> usize;
    /// True when nothing is parked.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct PartitionEntry {
    channel_id: String,
    config: ListenerPartitionConfig,
}

struct LevelLane {
    members: Vec<usize>,
    rr: WeightedRoundRobin,
}

struct PoolInner<Q, O> {
    scheduler: BulkheadScheduler,
    dispatcher: Arc<CommandDispatcher>,
    partitions: Vec<PartitionEntry>,
    index: HashMap<(String, usize), usize>,
    lanes: Mutex<Vec<LevelLane>>,
    queue: Mutex<Q>,
    outcomes: O,
    sink: SharedEventSink,
}

/// Parking-lot admission in front of a [`CommandDispatcher`].
pub struct AdmissionPool<Q, O, S> {
    inner: Arc<PoolInner<Q, O>>,
    spawner: S,
}

impl<Q, O, S: Clone> Clone for AdmissionPool<Q, O, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            spawner: self.spawner.clone(),
        }
    }
}

impl<Q, O, S> AdmissionPool<Q, O, S>
where
    Q: PartitionQueue + Send + 'static,
    O: OutcomeSink + 'static,
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Build a pool over the listener partitions of `channels`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] when a partition names a level the
    /// scheduler does not have, or a channel/priority pair repeats.
    pub fn new(
        scheduler: BulkheadScheduler,
        dispatcher: Arc<CommandDispatcher>,
        channels: &[ChannelConfig],
        queue: Q,
        outcomes: O,
        spawner: S,
        sink: SharedEventSink,
    ) -> Result<Self, SchedulerError> {
        let mut partitions = Vec::new();
        let mut index = HashMap::new();
        let mut lanes: Vec<LevelLane> = (0..scheduler.level_count())
            .map(|_| LevelLane {
                members: Vec::new(),
                rr: WeightedRoundRobin::default(),
            })
            .collect();

        for channel in channels {
            let channel_id = channel.channel_id.to_lowercase();
            for p in &channel.listener {
                let lane = lanes.get_mut(p.priority).ok_or_else(|| {
                    SchedulerError::InvalidConfig(format!(
                        "channel `{channel_id}` priority {} has no reserved level",
                        p.priority
                    ))
                })?;
                let id = partitions.len();
                if index.insert((channel_id.clone(), p.priority), id).is_some() {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "channel `{channel_id}` priority {} declared twice",
                        p.priority
                    )));
                }
                lane.members.push(id);
                lane.rr.push(p.priority_weighting);
                partitions.push(PartitionEntry {
                    channel_id: channel_id.clone(),
                    config: p.clone(),
                });
            }
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                scheduler,
                dispatcher,
                partitions,
                index,
                lanes: Mutex::new(lanes),
                queue: Mutex::new(queue),
                outcomes,
                sink,
            }),
            spawner,
        })
    }

    /// The scheduler deciding admission.
    #[must_use]
    pub fn scheduler(&self) -> &BulkheadScheduler {
        &self.inner.scheduler
    }

    /// The dispatcher running admitted units.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.inner.dispatcher
    }

    /// Number of parked units.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Submit a unit: run it now if admitted, park it otherwise.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownPartition`] when no listener partition matches
    /// the unit's channel and priority, [`SchedulerError::AdmissionTimeout`]
    /// when the unit is already past its deadline, and
    /// [`SchedulerError::QueueFull`] when it cannot be parked.
    pub fn submit(&self, unit: TransmissionUnit, now_ms: u128) -> Result<SubmitStatus, SchedulerError> {
        let inner = &self.inner;
        let key = (unit.channel_id.to_lowercase(), unit.priority);
        let partition = *inner.index.get(&key).ok_or_else(|| {
            SchedulerError::UnknownPartition(format!("{}/{}", key.0, key.1))
        })?;
        let entry = &inner.partitions[partition];
        let level = entry.config.priority;
        let deadline_ms = unit.created_at_ms + entry.config.admission_deadline().as_millis();

        if now_ms > deadline_ms {
            tracing::warn!(unit_id = %unit.id, level, "unit expired before admission");
            return Err(SchedulerError::AdmissionTimeout {
                level,
                waited_ms: now_ms.saturating_sub(unit.created_at_ms),
            });
        }

        if let Some(permit) = inner
            .scheduler
            .try_admit(level, entry.config.supports_rate_limiting)?
        {
            tracing::debug!(unit_id = %unit.id, channel_id = %entry.channel_id, level, "admitted");
            Self::run(Arc::clone(inner), self.spawner.clone(), unit, permit);
            return Ok(SubmitStatus::Running);
        }

        let demand = inner.scheduler.add_demand(level)?;
        let mut queue = inner.queue.lock();
        if queue.len() >= queue.max_depth() {
            tracing::warn!(unit_id = %unit.id, depth = queue.len(), "unit rejected: queue full");
            return Err(SchedulerError::QueueFull("max queue depth reached".into()));
        }
        tracing::debug!(unit_id = %unit.id, channel_id = %entry.channel_id, level, "parked");
        queue.park(ParkedUnit::new(unit, partition, deadline_ms, Some(demand)))?;
        drop(queue);

        // A slot may have freed between the failed admission and the park.
        Self::wake_parked(inner, &self.spawner);
        Ok(SubmitStatus::Parked)
    }

    /// Admit as much parked work as the scheduler allows.
    ///
    /// Runs after every completion; call it directly when admission may
    /// have changed without a completion, e.g. a rate limiter recovering.
    pub fn wake(&self) -> usize {
        Self::wake_parked(&self.inner, &self.spawner)
    }

    /// Let the outcome sink retry anything it held back.
    pub fn flush_outcomes(&self, now_ms: u128) -> usize {
        self.inner.outcomes.flush(now_ms)
    }

    /// Remove parked units past their deadline and report them as timed out.
    pub fn prune_expired(&self, now_ms: u128) -> usize {
        let expired = self.inner.queue.lock().prune_expired(now_ms);
        let count = expired.len();
        for parked in expired {
            let level = self.inner.partitions[parked.partition].config.priority;
            let waited_ms = now_ms.saturating_sub(parked.unit.created_at_ms);
            tracing::warn!(unit_id = %parked.unit.id, level, waited_ms, "admission timed out");
            self.inner.sink.record(CoreEvent::AdmissionTimeout {
                unit_id: parked.unit.id,
                level,
            });
            self.inner.outcomes.deliver(UnitReport {
                unit: parked.unit,
                outcome: UnitOutcome::TimedOut { waited_ms },
                responses: Vec::new(),
            });
        }
        count
    }

    fn run(inner: Arc<PoolInner<Q, O>>, spawner: S, mut unit: TransmissionUnit, permit: SlotPermit) {
        let next = spawner.clone();
        spawner.spawn(async move {
            let mut responses = Vec::new();
            let result = AssertUnwindSafe(
                inner.dispatcher.process_request(&mut unit, &mut responses),
            )
            .catch_unwind()
            .await;
            drop(permit);

            let outcome = match result {
                Ok(Ok(outcome)) => UnitOutcome::Dispatched(outcome),
                Ok(Err(e)) => {
                    tracing::warn!(unit_id = %unit.id, error = %e, "dispatch failed");
                    UnitOutcome::Rejected(e.to_string())
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(unit_id = %unit.id, panic = %message, "handler panicked");
                    responses.clear();
                    UnitOutcome::Rejected(format!("handler panicked: {message}"))
                }
            };
            inner.outcomes.deliver(UnitReport {
                unit,
                outcome,
                responses,
            });
            Self::wake_parked(&inner, &next);
        });
    }

    fn wake_parked(inner: &Arc<PoolInner<Q, O>>, spawner: &S) -> usize {
        let mut admitted = Vec::new();
        {
            let mut queue = inner.queue.lock();
            let mut lanes = inner.lanes.lock();
            for lane in lanes.iter_mut() {
                // Members deferred this pass; their siblings may still fit.
                let mut blocked: Vec<usize> = Vec::new();
                loop {
                    let ready = queue.ready();
                    let local: Vec<usize> = lane
                        .members
                        .iter()
                        .enumerate()
                        .filter(|(i, p)| ready.contains(*p) && !blocked.contains(i))
                        .filter(|(_, p)| {
                            let config = &inner.partitions[**p].config;
                            inner
                                .scheduler
                                .evaluate(config.priority, config.supports_rate_limiting)
                                .is_ok_and(AdmissionVerdict::is_admit)
                        })
                        .map(|(i, _)| i)
                        .collect();
                    let Some(pick) = lane.rr.select(&local) else {
                        break;
                    };
                    let partition = lane.members[pick];
                    let Some(mut parked) = queue.take(partition) else {
                        break;
                    };
                    let config = &inner.partitions[partition].config;
                    match inner
                        .scheduler
                        .try_admit(config.priority, config.supports_rate_limiting)
                    {
                        Ok(Some(permit)) => {
                            parked.demand.take();
                            admitted.push((parked.unit, permit));
                        }
                        Ok(None) => {
                            queue.restore(parked);
                            blocked.push(pick);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to admit parked unit");
                            queue.restore(parked);
                            blocked.push(pick);
                        }
                    }
                }
            }
        }

        let count = admitted.len();
        for (unit, permit) in admitted {
            tracing::debug!(unit_id = %unit.id, level = permit.level(), "woke parked unit");
            Self::run(Arc::clone(inner), spawner.clone(), unit, permit);
        }
        count
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
