//! Tests for event sinks

use prometheus_command_bus::core::events::{build_event_record, ChannelEventSink};
use prometheus_command_bus::core::{CoreEvent, EventSink, InMemoryEventSink};
use uuid::Uuid;

fn timeout_event(level: usize) -> CoreEvent {
    CoreEvent::AdmissionTimeout {
        unit_id: Uuid::new_v4(),
        level,
    }
}

#[test]
fn test_in_memory_sink_is_bounded() {
    let sink = InMemoryEventSink::new(2);
    for level in 0..5 {
        sink.record(timeout_event(level));
    }
    assert_eq!(sink.len(), 2);
    let labels = sink.events_labelled("admission_timeout");
    assert!(matches!(labels[1], CoreEvent::AdmissionTimeout { level: 4, .. }));
}

#[test]
fn test_event_record_serializes_with_type_tag() {
    let record = build_event_record(timeout_event(1));
    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["event"]["type"], "admission_timeout");
}

#[tokio::test]
async fn test_channel_sink_drops_when_full() {
    let (sink, mut rx) = ChannelEventSink::new(1);
    sink.record(timeout_event(0));
    sink.record(timeout_event(1));
    assert_eq!(sink.dropped(), 1);
    assert!(rx.recv().await.is_some());
}
