//! Tests for configuration validation

use std::time::Duration;

use prometheus_command_bus::config::{
    ChannelConfig, CoreConfig, ElectionConfig, ListenerPartitionConfig, ResourceTrackerConfig,
    SchedulerConfig, SenderPartitionConfig,
};

#[test]
fn test_scheduler_config_validation() {
    let valid = SchedulerConfig::new(1, 10).with_level(2, 10).with_level(0, 6);
    assert!(valid.validate().is_ok());
}

#[test]
fn test_scheduler_config_rejects_oversubscribed_reservations() {
    let invalid = SchedulerConfig::new(1, 4).with_level(3, 4).with_level(2, 4);
    let err = invalid.validate().unwrap_err();
    assert!(err.contains("sum of reserved minimums"), "{err}");
}

#[test]
fn test_scheduler_config_rejects_min_above_max() {
    let invalid = SchedulerConfig::new(8, 4).with_level(0, 4);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_default_scheduler_config_is_valid() {
    let cfg = SchedulerConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.level_count(), 3);
}

#[test]
fn test_bare_priority_partition_defaults() {
    let partitions = ListenerPartitionConfig::init(&[0, 1, 2]);
    assert!(partitions[0].supports_rate_limiting);
    assert!(!partitions[1].supports_rate_limiting);
    assert!((partitions[2].priority_weighting - 1.0).abs() < f64::EPSILON);

    let senders = SenderPartitionConfig::init(&[0, 1]);
    assert!(senders[0].supports_rate_limiting);
    assert!(!senders[1].supports_rate_limiting);
}

#[test]
fn test_admission_deadline_is_tighter_bound() {
    let p = ListenerPartitionConfig::new(1)
        .with_max_processing_time(Duration::from_secs(90))
        .with_fabric_max_message_lock(Duration::from_secs(45));
    assert_eq!(p.admission_deadline(), Duration::from_secs(45));
}

#[test]
fn test_channel_rejects_unknown_level() {
    let channel = ChannelConfig::with_priorities("orders", &[0, 3]);
    assert!(channel.validate(2).is_err());
    assert!(channel.validate(4).is_ok());
}

#[test]
fn test_tracker_config_requires_ordered_ratios() {
    let cfg = ResourceTrackerConfig {
        low_water_ratio: 0.6,
        cutout_ratio: 0.5,
        ..ResourceTrackerConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_election_config_threshold_at_least_two() {
    let cfg = ElectionConfig {
        missed_heartbeat_threshold: 1,
        ..ElectionConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_core_config_reports_section() {
    let cfg = CoreConfig {
        election: ElectionConfig {
            request_rounds: 0,
            ..ElectionConfig::default()
        },
        ..CoreConfig::default()
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.starts_with("election:"), "{err}");
}

#[test]
fn test_core_config_from_json() {
    let json = r#"{
        "scheduler": {
            "concurrent_requests_min": 2,
            "concurrent_requests_max": 12,
            "reservations": [
                {"level": 0, "reserved_minimum": 4, "reserved_maximum": 12},
                {"level": 1, "reserved_minimum": 2, "reserved_maximum": 8}
            ]
        },
        "election": {"heartbeat_interval_ms": 2000},
        "channels": [{"channel_id": "billing", "listener": [{"priority": 1}]}],
        "rate_limit_profiles": ["billing-db"],
        "max_parked_units": 64
    }"#;
    let cfg = CoreConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.election.heartbeat_interval(), Duration::from_secs(2));
    assert_eq!(cfg.election.request_rounds, 2);
    assert_eq!(cfg.max_parked_units, 64);
    assert_eq!(cfg.rate_limit_profiles, vec!["billing-db".to_string()]);
    assert!(!cfg.channels[0].listener[0].supports_rate_limiting);
}
