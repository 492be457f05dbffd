//! Outbound admission: sends on a configured sender partition take a bulkhead
//! slot at the partition's priority. A send that is not admitted is held in a
//! bounded backlog and retried on [`OutboundGate::flush`] until its lock
//! window runs out.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{ChannelConfig, SenderPartitionConfig};
use crate::core::bulkhead::BulkheadScheduler;
use crate::core::dispatch::TransmissionUnit;
use crate::core::SchedulerError;
use crate::infra::fabric::TransportFabric;

/// What happened to a unit handed to [`OutboundGate::send_via`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundStatus {
    /// Sent on the fabric.
    Sent,
    /// Waiting in the backlog for a slot.
    Held,
}

struct HeldSend {
    unit: TransmissionUnit,
    deadline_ms: u128,
}

/// Bulkhead admission for outgoing units.
pub struct OutboundGate {
    scheduler: BulkheadScheduler,
    partitions: HashMap<(String, usize), SenderPartitionConfig>,
    backlog: Mutex<VecDeque<HeldSend>>,
    max_backlog: usize,
}

impl std::fmt::Debug for OutboundGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGate")
            .field("partitions", &self.partitions.len())
            .field("held", &self.held())
            .field("max_backlog", &self.max_backlog)
            .finish_non_exhaustive()
    }
}

impl OutboundGate {
    /// Gate the sender partitions of `channels`, holding at most
    /// `max_backlog` units.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] when a sender partition names a
    /// level the scheduler does not have, or a channel/priority pair repeats.
    pub fn new(
        scheduler: BulkheadScheduler,
        channels: &[ChannelConfig],
        max_backlog: usize,
    ) -> Result<Self, SchedulerError> {
        let mut partitions = HashMap::new();
        for channel in channels {
            let channel_id = channel.channel_id.to_lowercase();
            for p in &channel.sender {
                if p.priority >= scheduler.level_count() {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "channel `{channel_id}` sender priority {} has no reserved level",
                        p.priority
                    )));
                }
                if partitions
                    .insert((channel_id.clone(), p.priority), p.clone())
                    .is_some()
                {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "channel `{channel_id}` sender priority {} declared twice",
                        p.priority
                    )));
                }
            }
        }
        Ok(Self {
            scheduler,
            partitions,
            backlog: Mutex::new(VecDeque::new()),
            max_backlog: max_backlog.max(1),
        })
    }

    /// Number of held units.
    #[must_use]
    pub fn held(&self) -> usize {
        self.backlog.lock().len()
    }

    /// Send `unit` if its partition is admitted, hold it otherwise. Units
    /// on a channel/priority without a sender partition go out ungated.
    ///
    /// A partition with held units keeps its order: new units queue behind.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::QueueFull`] when the backlog is full, and whatever
    /// the fabric returns for a failed send.
    pub fn send_via<F>(
        &self,
        fabric: &F,
        unit: TransmissionUnit,
        now_ms: u128,
    ) -> Result<OutboundStatus, SchedulerError>
    where
        F: TransportFabric + ?Sized,
    {
        let key = (unit.channel_id.to_lowercase(), unit.priority);
        let Some(config) = self.partitions.get(&key) else {
            fabric.send(unit)?;
            return Ok(OutboundStatus::Sent);
        };

        let mut backlog = self.backlog.lock();
        let queued_behind = backlog
            .iter()
            .any(|h| h.unit.priority == key.1 && h.unit.channel_id.to_lowercase() == key.0);
        if !queued_behind {
            if let Some(permit) = self
                .scheduler
                .try_admit(config.priority, config.supports_rate_limiting)?
            {
                drop(backlog);
                let sent = fabric.send(unit);
                drop(permit);
                return sent.map(|()| OutboundStatus::Sent);
            }
        }

        if backlog.len() >= self.max_backlog {
            tracing::warn!(unit_id = %unit.id, held = backlog.len(), "outbound backlog full");
            return Err(SchedulerError::QueueFull("outbound backlog full".into()));
        }
        tracing::debug!(
            unit_id = %unit.id,
            channel_id = %key.0,
            priority = key.1,
            "send held for admission"
        );
        backlog.push_back(HeldSend {
            deadline_ms: now_ms + config.fabric_max_message_lock().as_millis(),
            unit,
        });
        Ok(OutboundStatus::Held)
    }

    /// Retry held units in order. Expired units are dropped; a partition
    /// that is deferred stays blocked for the rest of the pass. Returns how
    /// many went out.
    pub fn flush<F>(&self, fabric: &F, now_ms: u128) -> usize
    where
        F: TransportFabric + ?Sized,
    {
        let mut backlog = self.backlog.lock();
        if backlog.is_empty() {
            return 0;
        }
        let mut sent = 0;
        let mut blocked: HashSet<(String, usize)> = HashSet::new();
        let mut kept = VecDeque::with_capacity(backlog.len());
        for held in backlog.drain(..) {
            if now_ms > held.deadline_ms {
                tracing::warn!(
                    unit_id = %held.unit.id,
                    channel_id = %held.unit.channel_id,
                    "held send expired"
                );
                continue;
            }
            let key = (held.unit.channel_id.to_lowercase(), held.unit.priority);
            if blocked.contains(&key) {
                kept.push_back(held);
                continue;
            }
            let admitted = self.partitions.get(&key).map_or(Ok(None), |config| {
                self.scheduler
                    .try_admit(config.priority, config.supports_rate_limiting)
            });
            match admitted {
                Ok(Some(_permit)) => {
                    let id = held.unit.id;
                    match fabric.send(held.unit) {
                        Ok(()) => sent += 1,
                        Err(e) => tracing::error!(unit_id = %id, error = %e, "failed to send held unit"),
                    }
                }
                Ok(None) => {
                    blocked.insert(key);
                    kept.push_back(held);
                }
                Err(e) => {
                    tracing::error!(unit_id = %held.unit.id, error = %e, "failed to admit held send");
                    blocked.insert(key);
                    kept.push_back(held);
                }
            }
        }
        *backlog = kept;
        sent
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::infra::fabric::InMemoryFabric;

    fn gate(max: usize, channels: &[ChannelConfig]) -> (OutboundGate, BulkheadScheduler) {
        let scheduler =
            BulkheadScheduler::new(SchedulerConfig::new(0, max).with_level(0, max).with_level(0, max))
                .unwrap();
        (OutboundGate::new(scheduler.clone(), channels, 4).unwrap(), scheduler)
    }

    fn replies(lock: Duration) -> ChannelConfig {
        ChannelConfig {
            channel_id: "Replies".into(),
            listener: Vec::new(),
            sender: vec![SenderPartitionConfig::new(1)
                .with_rate_limiting(false)
                .with_fabric_max_message_lock(lock)],
        }
    }

    fn reply() -> TransmissionUnit {
        let mut unit = TransmissionUnit::request("replies", "m", "a");
        unit.priority = 1;
        unit
    }

    #[test]
    fn send_waits_for_a_slot() {
        let fabric = InMemoryFabric::new(8, Duration::from_secs(60));
        let (gate, scheduler) = gate(1, &[replies(Duration::from_secs(60))]);
        let busy = scheduler.try_admit(1, false).unwrap();

        let first = reply();
        let now = first.created_at_ms;
        assert_eq!(gate.send_via(&fabric, first, now).unwrap(), OutboundStatus::Held);
        assert_eq!(gate.send_via(&fabric, reply(), now).unwrap(), OutboundStatus::Held);
        assert_eq!(gate.flush(&fabric, now), 0);
        assert_eq!(fabric.pending("replies", 1), 0);

        drop(busy);
        assert_eq!(gate.flush(&fabric, now + 10), 2);
        assert_eq!(fabric.pending("replies", 1), 2);
        assert_eq!(gate.held(), 0);
        assert_eq!(scheduler.global_active(), 0);
    }

    #[test]
    fn unconfigured_partition_is_not_gated() {
        let fabric = InMemoryFabric::new(8, Duration::from_secs(60));
        let (gate, scheduler) = gate(1, &[replies(Duration::from_secs(60))]);
        let _busy = scheduler.try_admit(0, false).unwrap();

        let unit = TransmissionUnit::request("audit", "m", "a");
        let now = unit.created_at_ms;
        assert_eq!(gate.send_via(&fabric, unit, now).unwrap(), OutboundStatus::Sent);
        assert_eq!(fabric.pending("audit", 0), 1);
    }

    #[test]
    fn expired_sends_are_dropped_and_backlog_is_bounded() {
        let fabric = InMemoryFabric::new(8, Duration::from_secs(60));
        let (gate, scheduler) = gate(1, &[replies(Duration::from_millis(100))]);
        let busy = scheduler.try_admit(1, false).unwrap();

        let now = reply().created_at_ms;
        for _ in 0..4 {
            assert_eq!(gate.send_via(&fabric, reply(), now).unwrap(), OutboundStatus::Held);
        }
        assert!(matches!(
            gate.send_via(&fabric, reply(), now),
            Err(SchedulerError::QueueFull(_))
        ));

        drop(busy);
        assert_eq!(gate.flush(&fabric, now + 101), 0);
        assert_eq!(gate.held(), 0);
        assert_eq!(fabric.pending("replies", 1), 0);
    }

    #[test]
    fn rejects_sender_without_level() {
        let scheduler = BulkheadScheduler::new(SchedulerConfig::new(0, 1).with_level(0, 1)).unwrap();
        let err = OutboundGate::new(scheduler, &[replies(Duration::from_secs(1))], 4).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }
}
