//! Master-job election under loss, late starts and failover.
//!
//! Negotiators are driven in lock-step rounds: every live instance ticks,
//! then every message produced is delivered to every other live instance,
//! including replies, until the round is quiet.

use prometheus_command_bus::config::ElectionConfig;
use prometheus_command_bus::core::{MasterJobNegotiator, MasterJobState, NegotiationMessage};
use proptest::prelude::*;

struct Cluster {
    config: ElectionConfig,
    nodes: Vec<MasterJobNegotiator>,
    live: Vec<bool>,
    started: Vec<bool>,
}

impl Cluster {
    fn new(ids: &[&str], config: &ElectionConfig) -> Self {
        Self {
            config: config.clone(),
            nodes: ids
                .iter()
                .map(|id| MasterJobNegotiator::new("nightly-report", *id, config.clone()))
                .collect(),
            live: vec![true; ids.len()],
            started: vec![false; ids.len()],
        }
    }

    fn start(&mut self, i: usize) -> Vec<(usize, NegotiationMessage)> {
        self.started[i] = true;
        self.nodes[i].start().into_iter().map(|m| (i, m)).collect()
    }

    /// One heartbeat interval. `lost(from, to)` decides which deliveries drop.
    fn round(&mut self, pending: Vec<(usize, NegotiationMessage)>, lost: &dyn Fn(usize, usize) -> bool) {
        let mut queue = pending;
        for i in 0..self.nodes.len() {
            if self.live[i] && self.started[i] {
                queue.extend(self.nodes[i].tick().into_iter().map(|m| (i, m)));
            }
        }
        self.deliver(queue, lost);
    }

    fn deliver(&mut self, mut queue: Vec<(usize, NegotiationMessage)>, lost: &dyn Fn(usize, usize) -> bool) {
        let mut hops = 0;
        while !queue.is_empty() && hops < 64 {
            hops += 1;
            let mut next = Vec::new();
            for (from, message) in queue {
                for to in 0..self.nodes.len() {
                    if to == from || !self.live[to] || !self.started[to] || lost(from, to) {
                        continue;
                    }
                    next.extend(self.nodes[to].receive(&message).into_iter().map(|m| (to, m)));
                }
            }
            queue = next;
        }
    }

    fn active(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| self.live[*i] && self.nodes[*i].state() == MasterJobState::Active)
            .collect()
    }

    fn crash(&mut self, i: usize) {
        self.live[i] = false;
    }

    fn stop(&mut self, i: usize) -> Vec<(usize, NegotiationMessage)> {
        let out = self.nodes[i].stop().into_iter().map(|m| (i, m)).collect();
        self.live[i] = false;
        out
    }

    fn revive(&mut self, i: usize) -> Vec<(usize, NegotiationMessage)> {
        self.live[i] = true;
        self.start(i)
    }

    /// Bring an instance back as a new process: fresh negotiator, iterations
    /// starting over.
    fn restart(&mut self, i: usize) -> Vec<(usize, NegotiationMessage)> {
        let id = self.nodes[i].originator_id().to_string();
        self.nodes[i] = MasterJobNegotiator::new("nightly-report", id, self.config.clone());
        self.live[i] = true;
        self.start(i)
    }

    fn stabilize(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.round(Vec::new(), &|_, _| false);
        }
    }
}

fn config() -> ElectionConfig {
    ElectionConfig {
        heartbeat_interval_ms: 1_000,
        missed_heartbeat_threshold: 3,
        request_rounds: 2,
    }
}

const IDS: [&str; 6] = ["node-a", "node-b", "node-c", "node-d", "node-e", "node-f"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_single_active_after_stabilization(
        n in 2usize..=6,
        start_rounds in proptest::collection::vec(0usize..6, 6),
        loss in proptest::collection::vec(any::<bool>(), 12 * 36),
        toggles in proptest::collection::vec(proptest::option::of(0usize..6), 12),
    ) {
        let cfg = config();
        let mut cluster = Cluster::new(&IDS[..n], &cfg);

        // Chaos: staggered starts, stops and restarts, arbitrary message loss.
        for round in 0..12 {
            let mut pending = Vec::new();
            for i in 0..n {
                if start_rounds[i] == round {
                    pending.extend(cluster.start(i));
                }
            }
            if let Some(i) = toggles[round].filter(|i| *i < n && cluster.started[*i]) {
                if cluster.live[i] {
                    pending.extend(cluster.stop(i));
                } else if round % 2 == 0 {
                    pending.extend(cluster.restart(i));
                } else {
                    pending.extend(cluster.revive(i));
                }
            }
            let lost = |from: usize, to: usize| loss[round * 36 + from * 6 + to];
            cluster.round(pending, &lost);
        }
        for i in 0..n {
            if !cluster.live[i] || !cluster.started[i] {
                let pending = cluster.revive(i);
                cluster.deliver(pending, &|_, _| false);
            }
        }

        cluster.stabilize(40);
        prop_assert_eq!(cluster.active().len(), 1);

        let leader = cluster.active()[0];
        for _ in 0..20 {
            cluster.stabilize(1);
            prop_assert_eq!(cluster.active(), vec![leader]);
        }
    }
}

#[test]
fn test_lowest_id_wins_simultaneous_start() {
    let cfg = config();
    let mut cluster = Cluster::new(&["node-c", "node-a", "node-b"], &cfg);
    let mut pending = Vec::new();
    for i in 0..3 {
        pending.extend(cluster.start(i));
    }
    cluster.deliver(pending, &|_, _| false);
    cluster.stabilize(cfg.request_rounds as usize);

    assert_eq!(cluster.active(), vec![1]);
    assert_eq!(cluster.nodes[0].state(), MasterJobState::Standby);
    assert_eq!(cluster.nodes[0].leader(), Some("node-a"));
}

#[test]
fn test_graceful_failover_within_one_round() {
    let cfg = config();
    let mut cluster = Cluster::new(&IDS[..3], &cfg);
    let mut pending = Vec::new();
    for i in 0..3 {
        pending.extend(cluster.start(i));
    }
    cluster.deliver(pending, &|_, _| false);
    cluster.stabilize(5);
    assert_eq!(cluster.active(), vec![0]);

    let relinquish = cluster.stop(0);
    cluster.deliver(relinquish, &|_, _| false);
    assert!(cluster.nodes[1].state().is_negotiating());

    let mut ticks = 0;
    while cluster.active().is_empty() {
        cluster.stabilize(1);
        ticks += 1;
        assert!(ticks <= cfg.request_rounds, "no successor after {ticks} ticks");
    }
    assert_eq!(cluster.active(), vec![1]);
}

#[test]
fn test_crash_failover_within_threshold_plus_round() {
    let cfg = config();
    let mut cluster = Cluster::new(&IDS[..3], &cfg);
    let mut pending = Vec::new();
    for i in 0..3 {
        pending.extend(cluster.start(i));
    }
    cluster.deliver(pending, &|_, _| false);
    cluster.stabilize(5);
    assert_eq!(cluster.active(), vec![0]);

    cluster.crash(0);
    let bound = cfg.missed_heartbeat_threshold + cfg.request_rounds;
    let mut ticks = 0;
    while cluster.active().is_empty() {
        cluster.stabilize(1);
        ticks += 1;
        assert!(ticks <= bound, "no successor after {ticks} ticks");
    }
    assert_eq!(cluster.active(), vec![1]);
    assert_eq!(cluster.nodes[2].leader(), Some("node-b"));
}

#[test]
fn test_stale_messages_are_ignored() {
    let cfg = config();
    let mut node = MasterJobNegotiator::new("nightly-report", "node-b", cfg.clone());
    let mut peer = MasterJobNegotiator::new("nightly-report", "node-a", cfg);
    node.start();
    let first = peer.start().remove(0);
    peer.tick();
    let heartbeat = peer.tick().remove(0);
    assert_eq!(peer.state(), MasterJobState::Active);

    node.receive(&heartbeat);
    assert_eq!(node.state(), MasterJobState::Standby);
    let before = node.missed_heartbeats();
    assert!(node.receive(&first).is_empty());
    assert_eq!(node.missed_heartbeats(), before);
}

#[test]
fn test_restarted_instance_rejoins_and_takes_over() {
    let cfg = config();
    let mut cluster = Cluster::new(&IDS[..3], &cfg);
    let mut pending = Vec::new();
    for i in 0..3 {
        pending.extend(cluster.start(i));
    }
    cluster.deliver(pending, &|_, _| false);
    cluster.stabilize(50);
    assert_eq!(cluster.active(), vec![0]);

    cluster.crash(0);
    cluster.stabilize(10);
    assert_eq!(cluster.active(), vec![1]);

    let pending = cluster.restart(0);
    cluster.deliver(pending, &|_, _| false);
    cluster.stabilize(5);
    assert_eq!(cluster.active(), vec![1]);
    assert_eq!(cluster.nodes[0].leader(), Some("node-b"));

    cluster.crash(1);
    cluster.stabilize(15);
    assert_eq!(cluster.active(), vec![0]);
    assert_eq!(cluster.nodes[2].leader(), Some("node-a"));
}
