//! Listener pump: moves units from the fabric into the admission pool.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ChannelConfig;
use crate::core::admission_pool::{AdmissionPool, OutcomeSink, PartitionQueue, SubmitStatus};
use crate::core::{SchedulerError, Spawn};
use crate::infra::fabric::TransportFabric;
use crate::util::clock::now_ms;

/// Counters for one pass of the pump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpStats {
    /// Units pulled from the fabric.
    pub received: usize,
    /// Units admitted straight away.
    pub running: usize,
    /// Units parked for later admission.
    pub parked: usize,
    /// Units handed back to the fabric for redelivery.
    pub abandoned: usize,
    /// Units the pool refused permanently.
    pub dead_lettered: usize,
    /// Parked units that expired this pass.
    pub expired: usize,
    /// Parked units admitted this pass.
    pub woken: usize,
    /// Held outbound units sent this pass.
    pub flushed: usize,
}

/// Pulls each listener partition in priority order and submits what it
/// receives.
pub struct ListenerPump<F: ?Sized, Q, O, S> {
    fabric: Arc<F>,
    pool: AdmissionPool<Q, O, S>,
    partitions: Vec<(String, usize)>,
    batch: usize,
}

impl<F, Q, O, S> ListenerPump<F, Q, O, S>
where
    F: TransportFabric + ?Sized + 'static,
    Q: PartitionQueue + Send + 'static,
    O: OutcomeSink + 'static,
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Pump every listener partition of `channels`, at most `batch` units per
    /// partition per pass.
    pub fn new(
        fabric: Arc<F>,
        pool: AdmissionPool<Q, O, S>,
        channels: &[ChannelConfig],
        batch: usize,
    ) -> Self {
        let mut partitions: Vec<(String, usize)> = channels
            .iter()
            .flat_map(|c| {
                c.listener
                    .iter()
                    .map(|p| (c.channel_id.to_lowercase(), p.priority))
            })
            .collect();
        partitions.sort_by_key(|(_, priority)| *priority);
        Self {
            fabric,
            pool,
            partitions,
            batch: batch.max(1),
        }
    }

    /// The pool units are submitted to.
    pub const fn pool(&self) -> &AdmissionPool<Q, O, S> {
        &self.pool
    }

    /// One pass: prune expired parked work, wake what fits, retry held
    /// outbound units, then pull.
    pub fn pump_once(&self) -> PumpStats {
        let mut stats = PumpStats {
            expired: self.pool.prune_expired(now_ms()),
            woken: self.pool.wake(),
            flushed: self.pool.flush_outcomes(now_ms()),
            ..PumpStats::default()
        };

        for (channel_id, priority) in &self.partitions {
            for _ in 0..self.batch {
                let Some(unit) = self.fabric.receive(channel_id, *priority) else {
                    break;
                };
                stats.received += 1;
                let id = unit.id;
                match self.pool.submit(unit, now_ms()) {
                    Ok(SubmitStatus::Running) => stats.running += 1,
                    Ok(SubmitStatus::Parked) => stats.parked += 1,
                    Err(SchedulerError::QueueFull(reason)) => {
                        tracing::debug!(unit_id = %id, reason, "pool full, abandoning unit");
                        self.fabric.abandon(id);
                        stats.abandoned += 1;
                    }
                    Err(e) => {
                        tracing::warn!(unit_id = %id, error = %e, "unit refused by pool");
                        self.fabric.dead_letter(id, &e.to_string());
                        stats.dead_lettered += 1;
                    }
                }
            }
        }
        stats
    }

    /// Run [`Self::pump_once`] every `interval` on the current runtime.
    pub fn spawn(self, interval: Duration) -> PumpHandle
    where
        F: Send + Sync,
        Q: Send,
        O: Send + Sync,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let stats = self.pump_once();
                        if stats.received > 0 || stats.expired > 0 || stats.flushed > 0 {
                            tracing::trace!(?stats, "listener pump pass");
                        }
                    }
                }
            }
            tracing::info!("listener pump stopped");
        });
        PumpHandle {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }
}

/// Handle to a running [`ListenerPump`].
#[derive(Debug)]
pub struct PumpHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PumpHandle {
    /// Stop pulling and wait for the current pass to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "listener pump task failed");
            }
        }
    }
}
