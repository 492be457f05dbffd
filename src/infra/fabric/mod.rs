//! Transport fabric boundary and in-memory adapters.
//!
//! A fabric moves [`TransmissionUnit`]s between services. Received units stay
//! locked until they are settled or their lock expires, at which point the
//! fabric redelivers them.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::core::admission_pool::{OutcomeSink, UnitOutcome, UnitReport};
use crate::core::dispatch::{Signal, TransmissionUnit};
use crate::core::SchedulerError;
use crate::util::clock::now_ms;

pub mod memory;
pub mod negotiation;
pub mod outbound;

pub use memory::InMemoryFabric;
pub use negotiation::{BusEndpoint, InMemoryNegotiationBus};
pub use outbound::{OutboundGate, OutboundStatus};

/// What any compliant transport must provide.
pub trait TransportFabric: Send + Sync {
    /// Send a unit to the partition named by its channel id and priority.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::QueueFull`] when the partition is at capacity,
    /// [`SchedulerError::Shutdown`] when the fabric is closed.
    fn send(&self, unit: TransmissionUnit) -> Result<(), SchedulerError>;

    /// Pull the next unit from a partition without blocking. The unit stays
    /// locked for [`Self::max_message_lock`].
    fn receive(&self, channel_id: &str, priority: usize) -> Option<TransmissionUnit>;

    /// Lock duration granted to a received unit.
    fn max_message_lock(&self) -> Duration;

    /// Acknowledge a received unit; false when it was not locked.
    fn complete(&self, unit_id: Uuid) -> bool;

    /// Release a received unit for redelivery; false when it was not locked.
    fn abandon(&self, unit_id: Uuid) -> bool;

    /// Remove a received unit permanently; false when it was not locked.
    fn dead_letter(&self, unit_id: Uuid, reason: &str) -> bool;
}

/// Outcome sink that settles units on a fabric, sends their responses, and
/// forwards the report to an inner sink.
///
/// Settlement follows the unit's signal: `Success` completes, `Failure`
/// abandons for redelivery, no signal leaves the lock to expire. Units that
/// timed out or were rejected are dead-lettered.
///
/// With an [`OutboundGate`] attached, responses on sender partitions wait for
/// a bulkhead slot; [`OutcomeSink::flush`] retries the ones held back.
pub struct FabricOutcomeSink<F: ?Sized, O> {
    fabric: Arc<F>,
    inner: O,
    outbound: Option<Arc<OutboundGate>>,
}

impl<F: ?Sized, O> FabricOutcomeSink<F, O> {
    /// Wrap `inner`, settling against `fabric`.
    pub const fn new(fabric: Arc<F>, inner: O) -> Self {
        Self {
            fabric,
            inner,
            outbound: None,
        }
    }

    /// Admit responses through `gate` before sending them.
    #[must_use]
    pub fn with_outbound(mut self, gate: Arc<OutboundGate>) -> Self {
        self.outbound = Some(gate);
        self
    }

    /// The wrapped sink.
    pub const fn inner(&self) -> &O {
        &self.inner
    }
}

impl<F, O> OutcomeSink for FabricOutcomeSink<F, O>
where
    F: TransportFabric + ?Sized,
    O: OutcomeSink,
{
    fn deliver(&self, report: UnitReport) {
        let now = now_ms();
        for response in &report.responses {
            let sent = match &self.outbound {
                Some(gate) => gate.send_via(&*self.fabric, response.clone(), now).map(|_| ()),
                None => self.fabric.send(response.clone()),
            };
            if let Err(e) = sent {
                tracing::error!(
                    unit_id = %report.unit.id,
                    channel_id = %response.channel_id,
                    error = %e,
                    "failed to send response"
                );
            }
        }

        let id = report.unit.id;
        let settled = match (&report.outcome, report.unit.signal) {
            (UnitOutcome::TimedOut { waited_ms }, _) => self
                .fabric
                .dead_letter(id, &format!("admission timed out after {waited_ms}ms")),
            (UnitOutcome::Rejected(reason), _) => self.fabric.dead_letter(id, reason),
            (UnitOutcome::Dispatched(_), Some(Signal::Success)) => self.fabric.complete(id),
            (UnitOutcome::Dispatched(_), Some(Signal::Failure)) => self.fabric.abandon(id),
            (UnitOutcome::Dispatched(_), None) => true,
        };
        if !settled {
            tracing::debug!(unit_id = %id, "unit was not locked on the fabric");
        }

        self.inner.deliver(report);
    }

    fn flush(&self, now_ms: u128) -> usize {
        let own = self
            .outbound
            .as_ref()
            .map_or(0, |gate| gate.flush(&*self.fabric, now_ms));
        own + self.inner.flush(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatch::DispatchOutcome;
    use crate::infra::outcome::InMemoryOutcomeSink;

    fn received(fabric: &InMemoryFabric) -> TransmissionUnit {
        fabric
            .send(TransmissionUnit::request("orders", "m", "a"))
            .unwrap();
        fabric.receive("orders", 0).unwrap()
    }

    #[test]
    fn success_completes_and_sends_responses() {
        let fabric = Arc::new(InMemoryFabric::new(8, Duration::from_secs(60)));
        let sink = FabricOutcomeSink::new(Arc::clone(&fabric), InMemoryOutcomeSink::new());
        let mut unit = received(&fabric);
        unit.signal = Some(Signal::Success);
        unit.response_channel = Some("replies".into());
        let response = unit.response("200", "ok");

        sink.deliver(UnitReport {
            unit,
            outcome: UnitOutcome::Dispatched(DispatchOutcome::Completed),
            responses: vec![response],
        });

        assert_eq!(fabric.locked_count(), 0);
        assert_eq!(fabric.pending("replies", 0), 1);
        assert_eq!(sink.inner().len(), 1);
    }

    #[test]
    fn failure_abandons_and_timeout_dead_letters() {
        let fabric = Arc::new(InMemoryFabric::new(8, Duration::from_secs(60)));
        let sink = FabricOutcomeSink::new(Arc::clone(&fabric), InMemoryOutcomeSink::new());

        let mut failed = received(&fabric);
        failed.signal = Some(Signal::Failure);
        sink.deliver(UnitReport {
            unit: failed,
            outcome: UnitOutcome::Dispatched(DispatchOutcome::Failed),
            responses: Vec::new(),
        });
        assert_eq!(fabric.pending("orders", 0), 1);

        let expired = fabric.receive("orders", 0).unwrap();
        sink.deliver(UnitReport {
            unit: expired,
            outcome: UnitOutcome::TimedOut { waited_ms: 40 },
            responses: Vec::new(),
        });
        assert_eq!(fabric.pending("orders", 0), 0);
        assert_eq!(fabric.dead_letters().len(), 1);
    }

    #[test]
    fn gated_responses_go_out_on_flush() {
        use crate::config::{ChannelConfig, SchedulerConfig, SenderPartitionConfig};
        use crate::core::bulkhead::BulkheadScheduler;

        let fabric = Arc::new(InMemoryFabric::new(8, Duration::from_secs(60)));
        let scheduler = BulkheadScheduler::new(SchedulerConfig::new(0, 1).with_level(0, 1)).unwrap();
        let channels = [ChannelConfig {
            channel_id: "replies".into(),
            listener: Vec::new(),
            sender: vec![SenderPartitionConfig::new(0).with_rate_limiting(false)],
        }];
        let gate = Arc::new(OutboundGate::new(scheduler.clone(), &channels, 8).unwrap());
        let sink = FabricOutcomeSink::new(Arc::clone(&fabric), InMemoryOutcomeSink::new())
            .with_outbound(Arc::clone(&gate));
        let busy = scheduler.try_admit(0, false).unwrap();

        let mut unit = received(&fabric);
        unit.signal = Some(Signal::Success);
        unit.response_channel = Some("replies".into());
        let response = unit.response("200", "ok");
        sink.deliver(UnitReport {
            unit,
            outcome: UnitOutcome::Dispatched(DispatchOutcome::Completed),
            responses: vec![response],
        });
        assert_eq!(fabric.locked_count(), 0);
        assert_eq!(fabric.pending("replies", 0), 0);
        assert_eq!(gate.held(), 1);

        drop(busy);
        assert_eq!(sink.flush(now_ms()), 1);
        assert_eq!(fabric.pending("replies", 0), 1);
    }

    #[test]
    fn no_signal_leaves_unit_locked() {
        let fabric = Arc::new(InMemoryFabric::new(8, Duration::from_secs(60)));
        let sink = FabricOutcomeSink::new(Arc::clone(&fabric), InMemoryOutcomeSink::new());
        let unit = received(&fabric);
        sink.deliver(UnitReport {
            unit,
            outcome: UnitOutcome::Dispatched(DispatchOutcome::Swallowed),
            responses: Vec::new(),
        });
        assert_eq!(fabric.locked_count(), 1);
    }
}
