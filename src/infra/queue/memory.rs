//! In-memory partition queue: one FIFO lane per partition.

use std::collections::{BTreeMap, VecDeque};

use crate::core::admission_pool::{ParkedUnit, PartitionQueue};
use crate::core::SchedulerError;

/// In-memory parking lot. Lanes are kept in partition order so `ready`
/// is deterministic.
#[derive(Debug)]
pub struct InMemoryPartitionQueue {
    max_depth: usize,
    len: usize,
    lanes: BTreeMap<usize, VecDeque<ParkedUnit>>,
}

impl InMemoryPartitionQueue {
    /// Create a queue holding at most `max_depth` parked units.
    #[must_use]
    pub const fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            len: 0,
            lanes: BTreeMap::new(),
        }
    }

    /// Parked units in one partition.
    #[must_use]
    pub fn lane_len(&self, partition: usize) -> usize {
        self.lanes.get(&partition).map_or(0, VecDeque::len)
    }
}

impl PartitionQueue for InMemoryPartitionQueue {
    fn park(&mut self, parked: ParkedUnit) -> Result<(), SchedulerError> {
        if self.len >= self.max_depth {
            return Err(SchedulerError::QueueFull("max queue depth reached".into()));
        }
        self.lanes.entry(parked.partition).or_default().push_back(parked);
        self.len += 1;
        Ok(())
    }

    fn restore(&mut self, parked: ParkedUnit) {
        self.lanes.entry(parked.partition).or_default().push_front(parked);
        self.len += 1;
    }

    fn take(&mut self, partition: usize) -> Option<ParkedUnit> {
        let lane = self.lanes.get_mut(&partition)?;
        let parked = lane.pop_front()?;
        if lane.is_empty() {
            self.lanes.remove(&partition);
        }
        self.len -= 1;
        Some(parked)
    }

    fn ready(&self) -> Vec<usize> {
        self.lanes
            .iter()
            .filter(|(_, lane)| !lane.is_empty())
            .map(|(p, _)| *p)
            .collect()
    }

    fn prune_expired(&mut self, now_ms: u128) -> Vec<ParkedUnit> {
        let mut expired = Vec::new();
        for lane in self.lanes.values_mut() {
            let (dead, alive): (VecDeque<_>, VecDeque<_>) =
                lane.drain(..).partition(|p| p.is_expired(now_ms));
            *lane = alive;
            expired.extend(dead);
        }
        self.lanes.retain(|_, lane| !lane.is_empty());
        self.len -= expired.len();
        expired
    }

    fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn len(&self) -> usize {
        self.len
    }
}
