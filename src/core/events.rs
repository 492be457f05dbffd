//! Statistics and telemetry events emitted by the core.
//!
//! The core never blocks on a sink: every implementation here either takes a
//! short uncontended lock, logs, or drops the event when its buffer is full.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::master_job::{MasterJobCommunicationEvent, MasterJobState};
use crate::util::clock::now_ms;

/// What happened to a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceEventKind {
    /// A unit of work started consuming the resource.
    Start,
    /// The unit finished successfully.
    Success,
    /// The unit finished with a non-success result.
    Failed,
    /// The resource asked the unit to retry.
    Retry,
    /// The resource failed outright.
    Exception,
    /// A terminal call was made on an unknown or already-closed token.
    Misuse,
}

/// A single observation against a resource profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Profile name.
    pub profile: String,
    /// Consumer name.
    pub consumer: String,
    /// Consumer group supplied at `start`.
    pub group: String,
    /// Correlation id supplied at `start`.
    pub correlation_id: String,
    /// Kind of observation.
    pub kind: ResourceEventKind,
    /// Elapsed time since the start mark, when known.
    pub elapsed_ms: Option<u128>,
    /// Free-form reason, used by retries.
    pub reason: Option<String>,
}

/// Events delivered to an [`EventSink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    /// A master-job negotiation message was sent or received.
    MasterJob(MasterJobCommunicationEvent),
    /// The election protocol changed state.
    MasterJobStateChanged {
        /// Command whose schedule is being negotiated.
        command_id: String,
        /// This instance's originator id.
        originator_id: String,
        /// Previous state.
        from: MasterJobState,
        /// New state.
        to: MasterJobState,
    },
    /// A resource health observation.
    Resource(ResourceEvent),
    /// Per-handler statistics after a dispatch completes.
    Handler {
        /// Handler reference id.
        reference_id: String,
        /// Currently executing requests.
        active: i64,
        /// Requests processed so far.
        processed: u64,
        /// Requests that raised an error so far.
        errors: u64,
    },
    /// No handler matched an inbound unit.
    UnresolvedRequest {
        /// Unit identifier.
        unit_id: Uuid,
        /// Channel segment.
        channel_id: String,
        /// Message type segment.
        message_type: String,
        /// Action type segment.
        action_type: String,
    },
    /// A parked unit exceeded its deadline before it could be admitted.
    AdmissionTimeout {
        /// Unit identifier.
        unit_id: Uuid,
        /// Priority level it waited on.
        level: usize,
    },
}

impl CoreEvent {
    /// Short label for logs and filtering.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::MasterJob(_) => "master_job",
            Self::MasterJobStateChanged { .. } => "master_job_state",
            Self::Resource(_) => "resource",
            Self::Handler { .. } => "handler",
            Self::UnresolvedRequest { .. } => "unresolved_request",
            Self::AdmissionTimeout { .. } => "admission_timeout",
        }
    }
}

/// A recorded event with identity and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event identifier.
    pub event_id: Uuid,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// The event itself.
    pub event: CoreEvent,
}

/// Stamp an event with an id and the current time.
#[must_use]
pub fn build_event_record(event: CoreEvent) -> EventRecord {
    EventRecord {
        event_id: Uuid::new_v4(),
        created_at_ms: now_ms(),
        event,
    }
}

/// Fire-and-forget statistics sink.
pub trait EventSink: Send + Sync {
    /// Record an event. Must not block.
    fn record(&self, event: CoreEvent);
}

/// Shared handle to a sink.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn record(&self, _event: CoreEvent) {}
}

/// Bounded in-memory sink for testing and dev.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<EventRecord>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Snapshot of stored events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<EventRecord> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events matching a label.
    #[must_use]
    pub fn events_labelled(&self, label: &str) -> Vec<CoreEvent> {
        self.events
            .lock()
            .iter()
            .filter(|r| r.event.label() == label)
            .map(|r| r.event.clone())
            .collect()
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True when nothing has been recorded (or everything was evicted).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, event: CoreEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(build_event_record(event));
    }
}

/// Sink that forwards events to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: CoreEvent) {
        tracing::debug!(event = event.label(), detail = ?event, "core event");
    }
}

/// Sink that forwards to a bounded tokio channel, dropping when full.
pub struct ChannelEventSink {
    tx: mpsc::Sender<EventRecord>,
    dropped: AtomicU64,
}

impl ChannelEventSink {
    /// Create a sink and the receiver that drains it.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the channel was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelEventSink {
    fn record(&self, event: CoreEvent) {
        if self.tx.try_send(build_event_record(event)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unresolved(channel: &str) -> CoreEvent {
        CoreEvent::UnresolvedRequest {
            unit_id: Uuid::new_v4(),
            channel_id: channel.into(),
            message_type: "m".into(),
            action_type: "a".into(),
        }
    }

    #[test]
    fn in_memory_sink_evicts_oldest() {
        let sink = InMemoryEventSink::new(2);
        sink.record(unresolved("one"));
        sink.record(unresolved("two"));
        sink.record(unresolved("three"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0].event,
            CoreEvent::UnresolvedRequest { channel_id, .. } if channel_id == "two"
        ));
    }

    #[tokio::test]
    async fn channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelEventSink::new(1);
        sink.record(unresolved("a"));
        sink.record(unresolved("b"));
        assert_eq!(sink.dropped(), 1);
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn labels_filter() {
        let sink = InMemoryEventSink::new(8);
        sink.record(unresolved("a"));
        sink.record(CoreEvent::AdmissionTimeout {
            unit_id: Uuid::new_v4(),
            level: 1,
        });
        assert_eq!(sink.events_labelled("admission_timeout").len(), 1);
    }
}
