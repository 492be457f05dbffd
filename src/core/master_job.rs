//! Master-job election among peer instances hosting the same command.
//!
//! [`MasterJobNegotiator`] is the state machine. It never touches a timer or a
//! transport: `start`, `tick`, `receive` and `stop` mutate the state and
//! return the messages to broadcast. [`MasterJobCoordinator`] owns one
//! negotiator inside a single task and feeds it heartbeat ticks and inbound
//! messages, so the state has exactly one writer.
//!
//! Guarantees: the lowest originator id wins a contested round, a graceful
//! stop hands over within one negotiation round, a crash is detected after
//! `missed_heartbeat_threshold` silent ticks. After a partition heals two
//! instances may briefly both be Active until heartbeats cross; consumers of
//! master-job output get at-least-once, not exactly-once, execution.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ElectionConfig;
use crate::core::events::{CoreEvent, SharedEventSink};
use crate::util::clock::now_ms;

/// Election state of one instance for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterJobState {
    /// Not negotiating; the schedule is dormant.
    Inactive,
    /// Collecting competing requests before deciding.
    Requesting,
    /// This instance fires the schedule and heartbeats.
    Active,
    /// Another instance is Active; listening only.
    Standby,
    /// The leader went quiet; re-running the election.
    Resyncing,
}

impl MasterJobState {
    /// True while collecting requests.
    #[must_use]
    pub const fn is_negotiating(self) -> bool {
        matches!(self, Self::Requesting | Self::Resyncing)
    }
}

impl std::fmt::Display for MasterJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Requesting => "requesting",
            Self::Active => "active",
            Self::Standby => "standby",
            Self::Resyncing => "resyncing",
        };
        f.write_str(s)
    }
}

/// What a negotiation message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationAction {
    /// "I want to be active."
    Request,
    /// "I am active."
    Heartbeat,
    /// "I am no longer active."
    Relinquish,
}

/// A message on the negotiation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationMessage {
    /// Command whose schedule is being negotiated.
    pub command_id: String,
    /// Sender instance.
    pub originator_id: String,
    /// One run of the sender. A restarted instance gets a new incarnation and
    /// starts its iterations again.
    pub incarnation: Uuid,
    /// Strictly increasing per sender incarnation.
    pub iteration: u64,
    /// Sender state at the time of sending.
    pub state: MasterJobState,
    /// What the sender is announcing.
    pub action: NegotiationAction,
}

/// Whether a message was sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Received from a peer.
    Incoming,
    /// Broadcast by this instance.
    Outgoing,
}

/// Telemetry view of a negotiation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterJobCommunicationEvent {
    /// Command id.
    pub command_id: String,
    /// Sent or received.
    pub direction: Direction,
    /// State carried by the message.
    pub state: MasterJobState,
    /// Action carried by the message.
    pub action: NegotiationAction,
    /// Sender iteration.
    pub iteration: u64,
    /// Sender id.
    pub originator_id: String,
}

impl MasterJobCommunicationEvent {
    /// Build from a message.
    #[must_use]
    pub fn from_message(direction: Direction, message: &NegotiationMessage) -> Self {
        Self {
            command_id: message.command_id.clone(),
            direction,
            state: message.state,
            action: message.action,
            iteration: message.iteration,
            originator_id: message.originator_id.clone(),
        }
    }
}

/// Election state machine for one `(command, instance)` pair.
#[derive(Debug, Clone)]
pub struct MasterJobNegotiator {
    command_id: String,
    originator_id: String,
    config: ElectionConfig,
    state: MasterJobState,
    incarnation: Uuid,
    iteration: u64,
    last_seen: HashMap<String, (Uuid, u64)>,
    competitors: BTreeSet<String>,
    rounds: u32,
    leader: Option<String>,
    missed: u32,
    last_heartbeat_ms: Option<u128>,
}

impl MasterJobNegotiator {
    /// Create an Inactive negotiator.
    #[must_use]
    pub fn new(
        command_id: impl Into<String>,
        originator_id: impl Into<String>,
        config: ElectionConfig,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            originator_id: originator_id.into(),
            config,
            state: MasterJobState::Inactive,
            incarnation: Uuid::new_v4(),
            iteration: 0,
            last_seen: HashMap::new(),
            competitors: BTreeSet::new(),
            rounds: 0,
            leader: None,
            missed: 0,
            last_heartbeat_ms: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> MasterJobState {
        self.state
    }

    /// This instance's id.
    #[must_use]
    pub fn originator_id(&self) -> &str {
        &self.originator_id
    }

    /// Command being negotiated.
    #[must_use]
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// Identity of this run of the instance.
    #[must_use]
    pub const fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    /// Iteration of the last message this instance sent.
    #[must_use]
    pub const fn iteration(&self) -> u64 {
        self.iteration
    }

    /// The instance this one defers to while in Standby.
    #[must_use]
    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    /// Consecutive ticks without a leader heartbeat.
    #[must_use]
    pub const fn missed_heartbeats(&self) -> u32 {
        self.missed
    }

    /// Wall-clock time of the last accepted leader heartbeat.
    #[must_use]
    pub const fn last_heartbeat_ms(&self) -> Option<u128> {
        self.last_heartbeat_ms
    }

    /// Begin negotiating. No-op unless Inactive.
    pub fn start(&mut self) -> Vec<NegotiationMessage> {
        if self.state != MasterJobState::Inactive {
            return Vec::new();
        }
        self.begin_round(MasterJobState::Requesting)
    }

    /// Advance one heartbeat interval.
    pub fn tick(&mut self) -> Vec<NegotiationMessage> {
        match self.state {
            MasterJobState::Inactive => Vec::new(),
            MasterJobState::Requesting | MasterJobState::Resyncing => {
                self.rounds += 1;
                if self.rounds < self.config.request_rounds {
                    return vec![self.outgoing(NegotiationAction::Request)];
                }
                self.decide()
            }
            MasterJobState::Active => vec![self.outgoing(NegotiationAction::Heartbeat)],
            MasterJobState::Standby => {
                self.missed += 1;
                if self.missed >= self.config.missed_heartbeat_threshold {
                    tracing::info!(
                        command_id = %self.command_id,
                        originator_id = %self.originator_id,
                        leader = ?self.leader,
                        missed = self.missed,
                        "leader heartbeat overdue"
                    );
                    return self.begin_round(MasterJobState::Resyncing);
                }
                Vec::new()
            }
        }
    }

    /// Apply a message from a peer. Own messages, other commands and stale
    /// iterations are ignored.
    pub fn receive(&mut self, message: &NegotiationMessage) -> Vec<NegotiationMessage> {
        if !self.accepts(message) {
            return Vec::new();
        }
        let from = message.originator_id.as_str();
        match (self.state, message.action) {
            (MasterJobState::Inactive, _) => Vec::new(),

            (MasterJobState::Requesting | MasterJobState::Resyncing, NegotiationAction::Request) => {
                self.competitors.insert(from.to_string());
                Vec::new()
            }
            (MasterJobState::Requesting | MasterJobState::Resyncing, NegotiationAction::Heartbeat) => {
                self.follow(from);
                Vec::new()
            }
            (MasterJobState::Requesting | MasterJobState::Resyncing, NegotiationAction::Relinquish) => {
                self.competitors.remove(from);
                Vec::new()
            }

            (MasterJobState::Active, NegotiationAction::Request) => {
                vec![self.outgoing(NegotiationAction::Heartbeat)]
            }
            (MasterJobState::Active, NegotiationAction::Heartbeat) => {
                if from < self.originator_id.as_str() {
                    self.follow(from);
                    Vec::new()
                } else {
                    vec![self.outgoing(NegotiationAction::Heartbeat)]
                }
            }
            (MasterJobState::Active, NegotiationAction::Relinquish) => Vec::new(),

            (MasterJobState::Standby, NegotiationAction::Heartbeat) => {
                let defer = self
                    .leader
                    .as_deref()
                    .is_none_or(|leader| from <= leader);
                if defer {
                    self.follow(from);
                }
                Vec::new()
            }
            (MasterJobState::Standby, NegotiationAction::Relinquish) => {
                if self.leader.as_deref() == Some(from) {
                    tracing::info!(
                        command_id = %self.command_id,
                        originator_id = %self.originator_id,
                        leader = from,
                        "leader relinquished"
                    );
                    self.begin_round(MasterJobState::Resyncing)
                } else {
                    Vec::new()
                }
            }
            (MasterJobState::Standby, NegotiationAction::Request) => Vec::new(),
        }
    }

    /// Leave the election. Returns a relinquish message when Active.
    pub fn stop(&mut self) -> Vec<NegotiationMessage> {
        let out = if self.state == MasterJobState::Active {
            vec![self.outgoing(NegotiationAction::Relinquish)]
        } else {
            Vec::new()
        };
        self.transition(MasterJobState::Inactive);
        self.leader = None;
        self.competitors.clear();
        self.rounds = 0;
        self.missed = 0;
        out
    }

    fn accepts(&mut self, message: &NegotiationMessage) -> bool {
        if message.command_id != self.command_id || message.originator_id == self.originator_id {
            return false;
        }
        match self.last_seen.get_mut(&message.originator_id) {
            Some((incarnation, last)) if *incarnation == message.incarnation => {
                if message.iteration <= *last {
                    tracing::debug!(
                        command_id = %self.command_id,
                        from = %message.originator_id,
                        iteration = message.iteration,
                        last = *last,
                        "dropping stale negotiation message"
                    );
                    return false;
                }
                *last = message.iteration;
            }
            Some(seen) => {
                tracing::info!(
                    command_id = %self.command_id,
                    from = %message.originator_id,
                    incarnation = %message.incarnation,
                    "peer restarted"
                );
                *seen = (message.incarnation, message.iteration);
            }
            None => {
                self.last_seen.insert(
                    message.originator_id.clone(),
                    (message.incarnation, message.iteration),
                );
            }
        }
        true
    }

    fn begin_round(&mut self, state: MasterJobState) -> Vec<NegotiationMessage> {
        self.transition(state);
        self.competitors.clear();
        self.rounds = 0;
        self.missed = 0;
        self.leader = None;
        vec![self.outgoing(NegotiationAction::Request)]
    }

    fn decide(&mut self) -> Vec<NegotiationMessage> {
        match self.competitors.first() {
            Some(lowest) if lowest.as_str() < self.originator_id.as_str() => {
                let lowest = lowest.clone();
                self.follow(&lowest);
                Vec::new()
            }
            _ => {
                self.transition(MasterJobState::Active);
                self.leader = None;
                vec![self.outgoing(NegotiationAction::Heartbeat)]
            }
        }
    }

    fn follow(&mut self, leader: &str) {
        self.transition(MasterJobState::Standby);
        self.leader = Some(leader.to_string());
        self.missed = 0;
        self.last_heartbeat_ms = Some(now_ms());
    }

    fn transition(&mut self, to: MasterJobState) {
        if self.state != to {
            tracing::info!(
                command_id = %self.command_id,
                originator_id = %self.originator_id,
                from = %self.state,
                to = %to,
                "master job state changed"
            );
            self.state = to;
        }
    }

    fn outgoing(&mut self, action: NegotiationAction) -> NegotiationMessage {
        self.iteration += 1;
        NegotiationMessage {
            command_id: self.command_id.clone(),
            originator_id: self.originator_id.clone(),
            incarnation: self.incarnation,
            iteration: self.iteration,
            state: self.state,
            action,
        }
    }
}

/// Broadcast side of the negotiation transport.
#[async_trait]
pub trait NegotiationChannel: Send + Sync {
    /// Deliver a message to every peer. Loss is tolerated by the protocol.
    async fn broadcast(&self, message: NegotiationMessage) -> anyhow::Result<()>;
}

/// Non-blocking read of whether this instance currently holds the master job.
#[derive(Debug, Clone)]
pub struct MasterJobGate {
    rx: watch::Receiver<MasterJobState>,
}

impl MasterJobGate {
    /// Gate pinned to a fixed state, for schedules that are not negotiated.
    #[must_use]
    pub fn fixed(state: MasterJobState) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self { rx }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> MasterJobState {
        *self.rx.borrow()
    }

    /// True only while Active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == MasterJobState::Active
    }
}

/// Serial actor driving one negotiator from timer ticks and inbound messages.
pub struct MasterJobCoordinator {
    state: watch::Receiver<MasterJobState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MasterJobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterJobCoordinator")
            .field("state", &*self.state.borrow())
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl MasterJobCoordinator {
    /// Start negotiating on the current tokio runtime.
    ///
    /// The first tick fires one heartbeat interval after start.
    pub fn spawn<C>(
        mut negotiator: MasterJobNegotiator,
        channel: Arc<C>,
        mut inbound: mpsc::Receiver<NegotiationMessage>,
        sink: SharedEventSink,
    ) -> Self
    where
        C: NegotiationChannel + ?Sized + 'static,
    {
        let (state_tx, state_rx) = watch::channel(negotiator.state());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let interval = negotiator.config.heartbeat_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut driver = Driver {
                channel,
                sink,
                state_tx,
            };
            let out = negotiator.start();
            driver.apply(&negotiator, out).await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let out = negotiator.tick();
                        driver.apply(&negotiator, out).await;
                    }
                    message = inbound.recv() => {
                        let Some(message) = message else { break };
                        let before = negotiator.seen(&message.originator_id);
                        let out = negotiator.receive(&message);
                        if negotiator.seen(&message.originator_id) != before {
                            driver.incoming(&message);
                        }
                        driver.apply(&negotiator, out).await;
                    }
                }
            }

            let out = negotiator.stop();
            driver.apply(&negotiator, out).await;
        });

        Self {
            state: state_rx,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Gate reflecting this coordinator's state.
    #[must_use]
    pub fn gate(&self) -> MasterJobGate {
        MasterJobGate {
            rx: self.state.clone(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> MasterJobState {
        *self.state.borrow()
    }

    /// Stop gracefully: relinquish if Active, then go Inactive. Waits for the
    /// actor to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "master job coordinator task failed");
            }
        }
    }

    /// Abort without relinquishing, as if the process crashed.
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.shutdown_tx.take();
    }
}

impl MasterJobNegotiator {
    fn seen(&self, originator_id: &str) -> Option<(Uuid, u64)> {
        self.last_seen.get(originator_id).copied()
    }

    #[cfg(test)]
    fn iteration_seen(&self, originator_id: &str) -> u64 {
        self.seen(originator_id).map_or(0, |(_, iteration)| iteration)
    }
}

struct Driver<C: ?Sized> {
    channel: Arc<C>,
    sink: SharedEventSink,
    state_tx: watch::Sender<MasterJobState>,
}

impl<C: NegotiationChannel + ?Sized> Driver<C> {
    fn incoming(&self, message: &NegotiationMessage) {
        self.sink.record(CoreEvent::MasterJob(
            MasterJobCommunicationEvent::from_message(Direction::Incoming, message),
        ));
    }

    async fn apply(&mut self, negotiator: &MasterJobNegotiator, out: Vec<NegotiationMessage>) {
        let previous = *self.state_tx.borrow();
        let current = negotiator.state();
        if previous != current {
            self.sink.record(CoreEvent::MasterJobStateChanged {
                command_id: negotiator.command_id().to_string(),
                originator_id: negotiator.originator_id().to_string(),
                from: previous,
                to: current,
            });
            self.state_tx.send_replace(current);
        }
        for message in out {
            self.sink.record(CoreEvent::MasterJob(
                MasterJobCommunicationEvent::from_message(Direction::Outgoing, &message),
            ));
            if let Err(e) = self.channel.broadcast(message).await {
                tracing::warn!(
                    command_id = negotiator.command_id(),
                    error = %e,
                    "negotiation broadcast failed"
                );
            }
        }
    }
}
