//! Tests for builder modules

use std::sync::Arc;

use prometheus_command_bus::builders::{build_core, build_core_with, REQUEST_RATE_LIMITER};
use prometheus_command_bus::config::{
    ChannelConfig, CoreConfig, SchedulerConfig, SenderPartitionConfig,
};
use prometheus_command_bus::core::{
    InMemoryEventSink, MasterJobState, NullEventSink, ResourceRequestResult,
};
use prometheus_command_bus::infra::InMemoryOutcomeSink;
use prometheus_command_bus::runtime::TokioSpawner;

fn config() -> CoreConfig {
    let mut cfg = CoreConfig {
        scheduler: SchedulerConfig::new(1, 4).with_level(1, 4).with_level(0, 4),
        rate_limit_profiles: vec!["ledger".into()],
        ..CoreConfig::default()
    };
    cfg.channels.push(ChannelConfig::with_priorities("payments", &[0, 1]));
    cfg
}

#[tokio::test]
async fn test_build_core_wires_rate_limiter_to_limited_levels() {
    let core = build_core(
        &config(),
        TokioSpawner::current().unwrap(),
        Arc::new(InMemoryOutcomeSink::new()),
        Arc::new(NullEventSink),
    )
    .unwrap();

    assert_eq!(core.rate_limiter.name(), REQUEST_RATE_LIMITER);
    let snapshot = core.scheduler.snapshot();
    assert_eq!(snapshot.levels[0].rate_limit_adjustment, Some(1.0));
    assert_eq!(snapshot.levels[1].rate_limit_adjustment, None);

    let consumer = core.tracker.register_consumer("ledger-client", "ledger");
    for _ in 0..5 {
        consumer.begin("g", "c").end(ResourceRequestResult::Timeout);
    }
    assert!(core.rate_limiter.rate_limit_adjustment_percentage().abs() < f64::EPSILON);
    assert!(core.scheduler.try_admit(0, true).unwrap().is_none());
    assert!(core.scheduler.try_admit(1, false).unwrap().is_some());
}

#[tokio::test]
async fn test_build_core_negotiator_uses_election_config() {
    let mut cfg = config();
    cfg.election.heartbeat_interval_ms = 250;
    let core = build_core(
        &cfg,
        TokioSpawner::current().unwrap(),
        Arc::new(InMemoryOutcomeSink::new()),
        Arc::new(InMemoryEventSink::new(8)),
    )
    .unwrap();
    let negotiator = core.negotiator("rollup", "instance-1");
    assert_eq!(negotiator.state(), MasterJobState::Inactive);
    assert_eq!(negotiator.command_id(), "rollup");
}

#[tokio::test]
async fn test_build_core_with_limits_sender_levels_and_shares_gate() {
    let mut cfg = config();
    cfg.channels.push(ChannelConfig {
        channel_id: "audit".into(),
        listener: Vec::new(),
        sender: vec![SenderPartitionConfig::new(1).with_rate_limiting(true)],
    });

    let mut handed = None;
    let core = build_core_with(
        &cfg,
        TokioSpawner::current().unwrap(),
        |gate| {
            handed = Some(Arc::clone(gate));
            Arc::new(InMemoryOutcomeSink::new())
        },
        Arc::new(NullEventSink),
    )
    .unwrap();

    let snapshot = core.scheduler.snapshot();
    assert_eq!(snapshot.levels[1].rate_limit_adjustment, Some(1.0));
    assert!(Arc::ptr_eq(&handed.unwrap(), &core.outbound));
    assert_eq!(core.outbound.held(), 0);
}
