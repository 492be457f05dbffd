//! Coordinators on an in-memory bus gating master-job schedules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prometheus_command_bus::config::{ElectionConfig, SchedulerConfig};
use prometheus_command_bus::core::{
    BulkheadScheduler, CommandJobSchedule, FnJob, InMemoryEventSink, MasterJobCoordinator,
    MasterJobNegotiator, MasterJobState, ScheduleHost, ScheduleJob,
};
use prometheus_command_bus::infra::InMemoryNegotiationBus;
use prometheus_command_bus::runtime::TokioSpawner;

const IDS: [&str; 3] = ["instance-a", "instance-b", "instance-c"];

fn election() -> ElectionConfig {
    ElectionConfig {
        heartbeat_interval_ms: 1_000,
        missed_heartbeat_threshold: 3,
        request_rounds: 2,
    }
}

struct Instance {
    coordinator: MasterJobCoordinator,
    host: ScheduleHost,
    runs: Arc<AtomicUsize>,
}

fn launch(bus: &InMemoryNegotiationBus, id: &str, sink: &Arc<InMemoryEventSink>) -> Instance {
    let (endpoint, inbound) = bus.join(id);
    let negotiator = MasterJobNegotiator::new("purge-expired", id, election());
    let coordinator = MasterJobCoordinator::spawn(negotiator, endpoint, inbound, sink.clone());

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let job: Arc<dyn ScheduleJob> = Arc::new(FnJob::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    let schedule = CommandJobSchedule::new("purge-expired", Duration::from_millis(500), job).master_job();
    let host = ScheduleHost::start(
        schedule,
        Some(coordinator.gate()),
        BulkheadScheduler::new(SchedulerConfig::new(0, 4).with_level(0, 4)).unwrap(),
        &TokioSpawner::current().unwrap(),
    );
    Instance {
        coordinator,
        host,
        runs,
    }
}

fn active(instances: &[Instance]) -> Vec<usize> {
    (0..instances.len())
        .filter(|i| instances[*i].coordinator.state() == MasterJobState::Active)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_only_the_active_instance_runs_the_schedule() {
    let bus = InMemoryNegotiationBus::new();
    let sink = Arc::new(InMemoryEventSink::new(1_024));
    let mut instances: Vec<Instance> = IDS.iter().map(|id| launch(&bus, id, &sink)).collect();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(active(&instances), vec![0]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(instances[0].runs.load(Ordering::SeqCst) >= 8);
    assert_eq!(instances[1].runs.load(Ordering::SeqCst), 0);
    assert_eq!(instances[2].runs.load(Ordering::SeqCst), 0);
    assert!(instances[1].host.statistics().skipped > 0);
    assert!(!sink.events_labelled("master_job_state").is_empty());

    for instance in &mut instances {
        instance.coordinator.stop().await;
        instance.host.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_crashed_leader_is_replaced() {
    let bus = InMemoryNegotiationBus::new();
    let sink = Arc::new(InMemoryEventSink::new(1_024));
    let mut instances: Vec<Instance> = IDS.iter().map(|id| launch(&bus, id, &sink)).collect();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(active(&instances), vec![0]);

    instances[0].coordinator.abort();
    instances[0].host.stop().await;
    let before = instances[1].runs.load(Ordering::SeqCst);

    // threshold + request rounds, plus one tick of phase slack
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(active(&instances[1..]), vec![0]);
    assert!(instances[1].runs.load(Ordering::SeqCst) > before);
    assert_eq!(instances[2].runs.load(Ordering::SeqCst), 0);

    for instance in &mut instances[1..] {
        instance.coordinator.stop().await;
        instance.host.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_instances_converge_after_heal() {
    let bus = InMemoryNegotiationBus::new();
    let sink = Arc::new(InMemoryEventSink::new(1_024));
    bus.isolate("instance-b");
    let mut instances: Vec<Instance> = IDS.iter().map(|id| launch(&bus, id, &sink)).collect();

    // Both sides of the partition elect their own leader.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(active(&instances), vec![0, 1]);

    bus.heal_all();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(active(&instances), vec![0]);

    for instance in &mut instances {
        instance.coordinator.stop().await;
        instance.host.stop().await;
    }
}
