//! End-to-end: fabric -> listener pump -> admission pool -> dispatcher -> fabric.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus_command_bus::builders::{build_core, build_core_with};
use prometheus_command_bus::config::{
    ChannelConfig, CoreConfig, ListenerPartitionConfig, SchedulerConfig, SenderPartitionConfig,
};
use prometheus_command_bus::core::{
    CommandHandler, FnHandler, InMemoryEventSink, MessageFilter, TransmissionUnit, UnitOutcome,
};
use prometheus_command_bus::infra::{
    FabricOutcomeSink, InMemoryFabric, InMemoryOutcomeSink, TransportFabric,
};
use prometheus_command_bus::runtime::{ListenerPump, TokioSpawner};
use tokio::sync::Notify;

struct RecordingHandler {
    started: Arc<Mutex<Vec<usize>>>,
    hold: Duration,
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn handle(
        &self,
        request: &TransmissionUnit,
        responses: &mut Vec<TransmissionUnit>,
    ) -> anyhow::Result<()> {
        self.started.lock().push(request.priority);
        tokio::time::sleep(self.hold).await;
        responses.push(request.response("200", "shipped"));
        Ok(())
    }
}

struct BlockingHandler(Arc<Notify>);

#[async_trait]
impl CommandHandler for BlockingHandler {
    async fn handle(
        &self,
        _request: &TransmissionUnit,
        _responses: &mut Vec<TransmissionUnit>,
    ) -> anyhow::Result<()> {
        self.0.notified().await;
        Ok(())
    }
}

async fn wait_for(outcomes: &InMemoryOutcomeSink, count: usize) {
    for _ in 0..500 {
        if outcomes.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("only {} of {count} outcomes delivered", outcomes.len());
}

#[tokio::test(start_paused = true)]
async fn test_units_flow_through_and_higher_priority_wakes_first() {
    let cfg = CoreConfig {
        scheduler: SchedulerConfig::new(1, 2).with_level(1, 2).with_level(0, 2),
        ..CoreConfig::default()
    }
    .with_channel(ChannelConfig::with_priorities("Orders", &[0, 1]));

    let fabric = Arc::new(InMemoryFabric::new(64, Duration::from_secs(60)));
    let outcomes = Arc::new(InMemoryOutcomeSink::new());
    let sink = Arc::new(InMemoryEventSink::new(256));
    let core = build_core(
        &cfg,
        TokioSpawner::current().unwrap(),
        FabricOutcomeSink::new(Arc::clone(&fabric), Arc::clone(&outcomes)),
        sink,
    )
    .unwrap();

    let started = Arc::new(Mutex::new(Vec::new()));
    core.registry
        .register(
            MessageFilter::exact("orders", "order", "ship"),
            Arc::new(RecordingHandler {
                started: Arc::clone(&started),
                hold: Duration::from_millis(20),
            }),
            "ship-order",
        )
        .unwrap();

    for priority in [1, 1, 1, 0, 0, 0] {
        fabric
            .send(
                TransmissionUnit::request("ORDERS", "Order", "Ship")
                    .with_priority(priority)
                    .with_response_channel("orders-replies"),
            )
            .unwrap();
    }

    let pump = ListenerPump::new(Arc::clone(&fabric), core.pool.clone(), &cfg.channels, 16);
    let stats = pump.pump_once();
    assert_eq!(stats.received, 6);
    assert_eq!(stats.running, 2);
    assert_eq!(stats.parked, 4);

    wait_for(&outcomes, 6).await;

    assert_eq!(&started.lock()[..3], &[0, 0, 0]);
    assert_eq!(fabric.locked_count(), 0);
    assert_eq!(
        fabric.pending("orders-replies", 0) + fabric.pending("orders-replies", 1),
        6
    );
    assert!(outcomes
        .reports()
        .iter()
        .all(|r| matches!(r.outcome, UnitOutcome::Dispatched(_))));
    assert_eq!(core.scheduler.global_active(), 0);
    assert_eq!(core.pool.parked(), 0);
}

#[tokio::test]
async fn test_parked_unit_past_deadline_is_dead_lettered() {
    let partition = ListenerPartitionConfig::new(0).with_max_processing_time(Duration::from_millis(30));
    let channel = ChannelConfig {
        channel_id: "reports".into(),
        listener: vec![partition],
        sender: Vec::new(),
    };
    let cfg = CoreConfig {
        scheduler: SchedulerConfig::new(1, 1).with_level(0, 1),
        ..CoreConfig::default()
    }
    .with_channel(channel);

    let fabric = Arc::new(InMemoryFabric::new(8, Duration::from_secs(60)));
    let outcomes = Arc::new(InMemoryOutcomeSink::new());
    let sink = Arc::new(InMemoryEventSink::new(64));
    let core = build_core(
        &cfg,
        TokioSpawner::current().unwrap(),
        FabricOutcomeSink::new(Arc::clone(&fabric), Arc::clone(&outcomes)),
        sink.clone(),
    )
    .unwrap();
    let release = Arc::new(Notify::new());
    core.registry
        .register(
            MessageFilter::channel("reports"),
            Arc::new(BlockingHandler(Arc::clone(&release))),
            "render-report",
        )
        .unwrap();

    let first = TransmissionUnit::request("reports", "report", "render");
    let second = TransmissionUnit::request("reports", "report", "render");
    let second_id = second.id;
    fabric.send(first).unwrap();
    fabric.send(second).unwrap();

    let pump = ListenerPump::new(Arc::clone(&fabric), core.pool.clone(), &cfg.channels, 8);
    let stats = pump.pump_once();
    assert_eq!((stats.running, stats.parked), (1, 1));

    tokio::time::sleep(Duration::from_millis(60)).await;
    let stats = pump.pump_once();
    assert_eq!(stats.expired, 1);

    let report = outcomes.report_for(second_id).unwrap();
    assert!(matches!(report.outcome, UnitOutcome::TimedOut { .. }));
    let dead = fabric.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].0.id, second_id);
    assert!(dead[0].1.contains("timed out"));
    assert_eq!(sink.events_labelled("admission_timeout").len(), 1);

    release.notify_one();
    wait_for(&outcomes, 2).await;
    assert_eq!(fabric.locked_count(), 0);
}

#[tokio::test]
async fn test_response_waits_for_its_sender_level() {
    let jobs = ChannelConfig {
        channel_id: "jobs".into(),
        listener: vec![
            ListenerPartitionConfig::new(0).with_rate_limiting(false),
            ListenerPartitionConfig::new(1),
        ],
        sender: Vec::new(),
    };
    let replies = ChannelConfig {
        channel_id: "jobs-replies".into(),
        listener: Vec::new(),
        sender: vec![SenderPartitionConfig::new(1)],
    };
    let cfg = CoreConfig {
        scheduler: SchedulerConfig::new(0, 2).with_level(1, 1).with_level(1, 1),
        ..CoreConfig::default()
    }
    .with_channel(jobs)
    .with_channel(replies);

    let fabric = Arc::new(InMemoryFabric::new(8, Duration::from_secs(60)));
    let outcomes = Arc::new(InMemoryOutcomeSink::new());
    let core = build_core_with(
        &cfg,
        TokioSpawner::current().unwrap(),
        |gate| {
            FabricOutcomeSink::new(Arc::clone(&fabric), Arc::clone(&outcomes))
                .with_outbound(Arc::clone(gate))
        },
        Arc::new(InMemoryEventSink::new(64)),
    )
    .unwrap();

    let release = Arc::new(Notify::new());
    core.registry
        .register(
            MessageFilter::exact("jobs", "job", "block"),
            Arc::new(BlockingHandler(Arc::clone(&release))),
            "block",
        )
        .unwrap();
    core.registry
        .register(
            MessageFilter::exact("jobs", "job", "reply"),
            Arc::new(FnHandler::new(|req, out| {
                out.push(req.response("200", "done").with_priority(1));
                Ok(())
            })),
            "reply",
        )
        .unwrap();

    fabric
        .send(TransmissionUnit::request("jobs", "job", "block").with_priority(1))
        .unwrap();
    fabric
        .send(TransmissionUnit::request("jobs", "job", "reply").with_response_channel("jobs-replies"))
        .unwrap();

    let pump = ListenerPump::new(Arc::clone(&fabric), core.pool.clone(), &cfg.channels, 8);
    assert_eq!(pump.pump_once().running, 2);
    wait_for(&outcomes, 1).await;
    assert_eq!(fabric.pending("jobs-replies", 1), 0);
    assert_eq!(core.outbound.held(), 1);

    release.notify_one();
    wait_for(&outcomes, 2).await;
    assert_eq!(pump.pump_once().flushed, 1);
    assert_eq!(fabric.pending("jobs-replies", 1), 1);
    assert_eq!(core.outbound.held(), 0);
}

#[test]
fn test_invalid_configuration_aborts_build() {
    let cfg = CoreConfig {
        scheduler: SchedulerConfig::new(1, 4).with_level(5, 4),
        ..CoreConfig::default()
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let spawner = TokioSpawner::new(runtime.handle().clone());
    let err = build_core(&cfg, spawner, Arc::new(InMemoryOutcomeSink::new()), Arc::new(InMemoryEventSink::new(1)))
        .unwrap_err();
    assert!(err.to_string().contains("invalid configuration"), "{err}");
}
