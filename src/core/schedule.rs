//! Recurring jobs hosted by a command, optionally gated by master-job election.
//!
//! A schedule marked as a master job only fires while its gate reports
//! Active; ticks that arrive while the instance is not Active are counted as
//! skipped and the job is not called. Every tick that does fire is admitted
//! by the bulkhead scheduler at the schedule's priority first; a tick that
//! gets no slot within one interval is skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::core::admission_pool::Spawn;
use crate::core::bulkhead::BulkheadScheduler;
use crate::core::error::SchedulerError;
use crate::core::master_job::MasterJobGate;

/// Work run by a schedule.
#[async_trait]
pub trait ScheduleJob: Send + Sync {
    /// Run once.
    async fn run(&self) -> anyhow::Result<()>;
}

/// Adapts a synchronous closure into a [`ScheduleJob`].
pub struct FnJob<F>(F);

impl<F> FnJob<F>
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    /// Wrap a closure.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> ScheduleJob for FnJob<F>
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    async fn run(&self) -> anyhow::Result<()> {
        (self.0)()
    }
}

/// A recurring job definition.
#[derive(Clone)]
pub struct CommandJobSchedule {
    /// Name used in logs.
    pub name: String,
    /// Time between runs.
    pub interval: Duration,
    /// Priority level a tick is admitted under.
    pub priority: usize,
    /// Delay before the first run.
    pub initial_delay: Duration,
    /// Runs may outlast the interval; missed ticks are skipped rather than
    /// delayed.
    pub is_long_running: bool,
    /// Only fire while this instance holds the master job.
    pub is_master_job: bool,
    /// Runs once before the first tick.
    pub tear_up: Option<Arc<dyn ScheduleJob>>,
    /// Runs once after the schedule stops.
    pub tear_down: Option<Arc<dyn ScheduleJob>>,
    /// The recurring work.
    pub job: Arc<dyn ScheduleJob>,
}

impl std::fmt::Debug for CommandJobSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandJobSchedule")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("priority", &self.priority)
            .field("initial_delay", &self.initial_delay)
            .field("is_long_running", &self.is_long_running)
            .field("is_master_job", &self.is_master_job)
            .finish_non_exhaustive()
    }
}

impl CommandJobSchedule {
    /// Schedule `job` every `interval`, starting immediately.
    pub fn new(name: impl Into<String>, interval: Duration, job: Arc<dyn ScheduleJob>) -> Self {
        Self {
            name: name.into(),
            interval,
            priority: 0,
            initial_delay: Duration::ZERO,
            is_long_running: false,
            is_master_job: false,
            tear_up: None,
            tear_down: None,
            job,
        }
    }

    /// Admit ticks at `priority`.
    #[must_use]
    pub const fn with_priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }

    /// Wait before the first run.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Mark as long-running.
    #[must_use]
    pub const fn long_running(mut self) -> Self {
        self.is_long_running = true;
        self
    }

    /// Mark as a master job.
    #[must_use]
    pub const fn master_job(mut self) -> Self {
        self.is_master_job = true;
        self
    }

    /// Run `job` once before the first tick.
    #[must_use]
    pub fn with_tear_up(mut self, job: Arc<dyn ScheduleJob>) -> Self {
        self.tear_up = Some(job);
        self
    }

    /// Run `job` once after stopping.
    #[must_use]
    pub fn with_tear_down(mut self, job: Arc<dyn ScheduleJob>) -> Self {
        self.tear_down = Some(job);
        self
    }
}

/// Counters for one hosted schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStatistics {
    /// Runs that returned Ok.
    pub executed: u64,
    /// Ticks suppressed because the instance was not Active or no slot was
    /// free within one interval.
    pub skipped: u64,
    /// Runs that returned an error.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// A running schedule.
#[derive(Debug)]
pub struct ScheduleHost {
    name: String,
    counters: Arc<Counters>,
    shutdown_tx: Option<watch::Sender<bool>>,
    done_rx: Option<oneshot::Receiver<()>>,
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters").finish_non_exhaustive()
    }
}

impl ScheduleHost {
    /// Start hosting `schedule` on `spawner`, admitting each tick through
    /// `admission`.
    ///
    /// A master-job schedule without a gate never fires.
    pub fn start<S: Spawn>(
        schedule: CommandJobSchedule,
        gate: Option<MasterJobGate>,
        admission: BulkheadScheduler,
        spawner: &S,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let name = schedule.name.clone();

        if schedule.is_master_job && gate.is_none() {
            tracing::warn!(schedule = %name, "master job schedule has no gate and will never fire");
        }

        let task_counters = Arc::clone(&counters);
        spawner.spawn(async move {
            run_schedule(schedule, gate, &admission, &task_counters, &mut shutdown_rx).await;
            let _ = done_tx.send(());
        });

        Self {
            name,
            counters,
            shutdown_tx: Some(shutdown_tx),
            done_rx: Some(done_rx),
        }
    }

    /// Schedule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current counters.
    #[must_use]
    pub fn statistics(&self) -> ScheduleStatistics {
        ScheduleStatistics {
            executed: self.counters.executed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop ticking, run tear-down, and wait for the task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(rx) = self.done_rx.take() {
            if rx.await.is_err() {
                tracing::error!(schedule = %self.name, "schedule task ended without finishing");
            }
        }
    }
}

async fn run_schedule(
    schedule: CommandJobSchedule,
    gate: Option<MasterJobGate>,
    admission: &BulkheadScheduler,
    counters: &Counters,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let name = schedule.name.as_str();

    if !schedule.initial_delay.is_zero() {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            () = tokio::time::sleep(schedule.initial_delay) => {}
        }
    }

    if let Some(tear_up) = &schedule.tear_up {
        if let Err(e) = tear_up.run().await {
            tracing::error!(schedule = name, error = %e, "tear-up failed, schedule not started");
            counters.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }
    tracing::info!(schedule = name, interval_ms = schedule.interval.as_millis(), "schedule started");

    let mut ticker = tokio::time::interval(schedule.interval);
    ticker.set_missed_tick_behavior(if schedule.is_long_running {
        MissedTickBehavior::Skip
    } else {
        MissedTickBehavior::Delay
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                if schedule.is_master_job && !gate.as_ref().is_some_and(MasterJobGate::is_active) {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(schedule = name, "not master, tick skipped");
                    continue;
                }
                let permit = match admission.acquire(schedule.priority, false, schedule.interval).await {
                    Ok(permit) => permit,
                    Err(SchedulerError::AdmissionTimeout { waited_ms, .. }) => {
                        counters.skipped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(schedule = name, waited_ms, "no slot for tick, skipped");
                        continue;
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(schedule = name, error = %e, "tick could not be admitted");
                        continue;
                    }
                };
                let result = schedule.job.run().await;
                drop(permit);
                match result {
                    Ok(()) => {
                        counters.executed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(schedule = name, error = %e, "scheduled job failed");
                    }
                }
            }
        }
    }

    if let Some(tear_down) = &schedule.tear_down {
        if let Err(e) = tear_down.run().await {
            tracing::warn!(schedule = name, error = %e, "tear-down failed");
        }
    }
    tracing::info!(schedule = name, "schedule stopped");
}
