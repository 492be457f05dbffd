//! In-memory fabric over crossbeam channels, one bounded channel per partition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::TransportFabric;
use crate::core::dispatch::TransmissionUnit;
use crate::core::SchedulerError;

type PartitionKey = (String, usize);

struct Lane {
    tx: Sender<TransmissionUnit>,
    rx: Receiver<TransmissionUnit>,
}

struct Locked {
    unit: TransmissionUnit,
    until: Instant,
}

/// Process-local fabric for tests and single-process deployments.
pub struct InMemoryFabric {
    capacity: usize,
    lock: Duration,
    lanes: RwLock<HashMap<PartitionKey, Lane>>,
    locked: Mutex<HashMap<Uuid, Locked>>,
    dead_letters: Mutex<Vec<(TransmissionUnit, String)>>,
    redelivered: AtomicU64,
}

impl std::fmt::Debug for InMemoryFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryFabric")
            .field("capacity", &self.capacity)
            .field("lock", &self.lock)
            .field("locked", &self.locked.lock().len())
            .finish_non_exhaustive()
    }
}

impl InMemoryFabric {
    /// Create a fabric with `capacity` units per partition and the given lock.
    #[must_use]
    pub fn new(capacity: usize, lock: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            lock,
            lanes: RwLock::new(HashMap::new()),
            locked: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            redelivered: AtomicU64::new(0),
        }
    }

    fn with_lane<T>(&self, key: PartitionKey, f: impl FnOnce(&Lane) -> T) -> T {
        if let Some(lane) = self.lanes.read().get(&key) {
            return f(lane);
        }
        let mut lanes = self.lanes.write();
        let lane = lanes.entry(key).or_insert_with(|| {
            let (tx, rx) = bounded(self.capacity);
            Lane { tx, rx }
        });
        f(lane)
    }

    fn requeue(&self, unit: TransmissionUnit) {
        let key = (unit.channel_id.to_lowercase(), unit.priority);
        let id = unit.id;
        if let Err(e) = self.with_lane(key, |lane| lane.tx.try_send(unit)) {
            tracing::warn!(unit_id = %id, "redelivery failed, dead-lettering");
            self.dead_letters
                .lock()
                .push((e.into_inner(), "redelivery failed".into()));
        } else {
            self.redelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Redeliver units whose lock expired before `now`.
    pub fn expire_locks(&self, now: Instant) -> usize {
        let expired: Vec<TransmissionUnit> = {
            let mut locked = self.locked.lock();
            let ids: Vec<Uuid> = locked
                .iter()
                .filter(|(_, l)| l.until <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| locked.remove(id))
                .map(|l| l.unit)
                .collect()
        };
        let count = expired.len();
        for unit in expired {
            self.requeue(unit);
        }
        count
    }

    /// Units waiting in a partition.
    #[must_use]
    pub fn pending(&self, channel_id: &str, priority: usize) -> usize {
        self.lanes
            .read()
            .get(&(channel_id.to_lowercase(), priority))
            .map_or(0, |lane| lane.rx.len())
    }

    /// Units received and not yet settled.
    #[must_use]
    pub fn locked_count(&self) -> usize {
        self.locked.lock().len()
    }

    /// Dead-lettered units with their reasons.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<(TransmissionUnit, String)> {
        self.dead_letters.lock().clone()
    }

    /// Units put back after an abandon or an expired lock.
    #[must_use]
    pub fn redelivered(&self) -> u64 {
        self.redelivered.load(Ordering::Relaxed)
    }
}

impl TransportFabric for InMemoryFabric {
    fn send(&self, unit: TransmissionUnit) -> Result<(), SchedulerError> {
        let key = (unit.channel_id.to_lowercase(), unit.priority);
        let label = format!("{}/{}", key.0, key.1);
        match self.with_lane(key, |lane| lane.tx.try_send(unit)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(partition = %label, "fabric partition full");
                Err(SchedulerError::QueueFull(label))
            }
            Err(TrySendError::Disconnected(_)) => Err(SchedulerError::Shutdown),
        }
    }

    fn receive(&self, channel_id: &str, priority: usize) -> Option<TransmissionUnit> {
        let unit = self
            .lanes
            .read()
            .get(&(channel_id.to_lowercase(), priority))?
            .rx
            .try_recv()
            .ok()?;
        self.locked.lock().insert(
            unit.id,
            Locked {
                unit: unit.clone(),
                until: Instant::now() + self.lock,
            },
        );
        Some(unit)
    }

    fn max_message_lock(&self) -> Duration {
        self.lock
    }

    fn complete(&self, unit_id: Uuid) -> bool {
        self.locked.lock().remove(&unit_id).is_some()
    }

    fn abandon(&self, unit_id: Uuid) -> bool {
        let Some(locked) = self.locked.lock().remove(&unit_id) else {
            return false;
        };
        self.requeue(locked.unit);
        true
    }

    fn dead_letter(&self, unit_id: Uuid, reason: &str) -> bool {
        let Some(locked) = self.locked.lock().remove(&unit_id) else {
            return false;
        };
        tracing::warn!(unit_id = %unit_id, reason, "unit dead-lettered");
        self.dead_letters.lock().push((locked.unit, reason.to_string()));
        true
    }
}
