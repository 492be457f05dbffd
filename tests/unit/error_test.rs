//! Tests for error types

use prometheus_command_bus::core::{DispatchError, SchedulerError};

#[test]
fn test_queue_full_error() {
    let err = SchedulerError::QueueFull("orders/0".to_string());
    assert_eq!(format!("{}", err), "queue full: orders/0");
}

#[test]
fn test_unknown_partition_error() {
    let err = SchedulerError::UnknownPartition("orders/7".to_string());
    assert_eq!(format!("{}", err), "no partition configured for orders/7");
}

#[test]
fn test_invalid_config_error() {
    let err = SchedulerError::InvalidConfig("scheduler: bad".to_string());
    assert_eq!(format!("{}", err), "invalid configuration: scheduler: bad");
}

#[test]
fn test_backend_error() {
    let err = SchedulerError::Backend("connection failed".to_string());
    assert_eq!(format!("{}", err), "backend error: connection failed");
}

#[test]
fn test_handler_not_resolved_error() {
    let err = DispatchError::HandlerNotResolved {
        channel_id: "chan".into(),
        message_type: "franky".into(),
        action_type: "johnny5".into(),
    };
    assert_eq!(format!("{}", err), "handler not resolved for chan/franky/johnny5");
}

#[test]
fn test_duplicate_registration_error() {
    let err = DispatchError::DuplicateRegistration("orders/*/*".into());
    assert!(format!("{}", err).contains("orders/*/*"));
}
