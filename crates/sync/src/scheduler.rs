//! Network-aware scheduler.
//!
//! A background task that drains the queue whenever there is reason to
//! believe work can make progress:
//! - connectivity came back (debounced)
//! - periodic tick while online, which also evicts expired `DONE` jobs
//! - explicit `sync_now`
//!
//! A drain claims jobs up to `max_concurrent` and hands each to the engine
//! on its own task; as jobs settle, more are claimed until nothing is
//! eligible. Going offline never interrupts a step: the engine's gate stops
//! the next step from starting and the job is suspended.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use verdant_infra::jobs::{DurableStore, QueueError};
use verdant_infra::workflow::{RunOutcome, WorkflowEngine};

use crate::config::SchedulerConfig;
use crate::offline::{Connectivity, ConnectivityState};

/// What one drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub suspended: usize,
    pub cancelled: usize,
    /// Runs whose outcome the queue could not record
    pub errors: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Completed { .. } => self.succeeded += 1,
            RunOutcome::Failed { .. } => self.failed += 1,
            RunOutcome::Suspended => self.suspended += 1,
            RunOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is not running")]
    Stopped,
    #[error("scheduler task failed: {0}")]
    Join(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

enum Command {
    SyncNow(oneshot::Sender<DrainReport>),
}

/// Why a drain started; logged with its summary.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    Connectivity,
    Tick,
    Manual,
}

pub struct Scheduler<S: DurableStore + 'static> {
    engine: Arc<WorkflowEngine<S>>,
    connectivity: Connectivity,
    config: SchedulerConfig,
    last_drain: Option<Instant>,
}

impl<S: DurableStore + 'static> Scheduler<S> {
    pub fn new(engine: Arc<WorkflowEngine<S>>, connectivity: Connectivity, config: SchedulerConfig) -> Self {
        Self {
            engine,
            connectivity,
            config,
            last_drain: None,
        }
    }

    /// Claim and run eligible jobs until none remain or connectivity drops.
    ///
    /// Returns an empty report when offline.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.connectivity.is_online() {
            debug!("skipping drain, offline");
            return report;
        }

        let queue = self.engine.queue().clone();
        let mut in_flight = JoinSet::new();
        let mut exhausted = false;
        let mut storage_failed = false;

        loop {
            while !exhausted && in_flight.len() < self.config.max_concurrent && self.connectivity.is_online() {
                match queue.claim_next(None).await {
                    Ok(Some(job)) => {
                        report.claimed += 1;
                        let engine = self.engine.clone();
                        let gate = self.connectivity.clone();
                        in_flight.spawn(async move { engine.run(job, &gate).await });
                    }
                    Ok(None) => exhausted = true,
                    Err(e) => {
                        error!(error = %e, "failed to claim next job");
                        report.errors += 1;
                        storage_failed = true;
                        exhausted = true;
                    }
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok(outcome)) => report.record(&outcome),
                Ok(Err(e)) => {
                    warn!(error = %e, "job run ended without a recorded outcome");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "job task panicked");
                    report.errors += 1;
                }
            }
            // A settled job may have freed a slot for one that became eligible meanwhile.
            exhausted = storage_failed;
        }

        report
    }

    /// Start the background task.
    pub fn start(self) -> SchedulerHandle {
        let (commands, rx) = mpsc::channel(8);
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(rx, shutdown.clone()));
        SchedulerHandle {
            commands,
            shutdown,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, shutdown: Arc<Notify>) {
        info!(max_concurrent = self.config.max_concurrent, "scheduler started");

        let mut connectivity = self.connectivity.subscribe();
        let mut ticks = tokio::time::interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut online_since: Option<Instant> = None;

        loop {
            let debounce_deadline = online_since.map(|at| at + self.config.debounce);
            let debounced = async {
                match debounce_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.notified() => {
                    info!("scheduler received shutdown signal");
                    break;
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connectivity.borrow_and_update();
                    online_since = match state {
                        ConnectivityState::Online => Some(Instant::now()),
                        ConnectivityState::Offline => {
                            if online_since.is_some() {
                                debug!("online signal did not outlast the debounce window");
                            }
                            None
                        }
                    };
                }
                _ = debounced => {
                    online_since = None;
                    if self.connectivity.is_online() {
                        self.throttled_drain(Trigger::Connectivity).await;
                    }
                }
                _ = ticks.tick() => {
                    if self.connectivity.is_online() {
                        self.evict_expired().await;
                        self.throttled_drain(Trigger::Tick).await;
                    }
                }
                Some(command) = commands.recv() => match command {
                    Command::SyncNow(reply) => {
                        let report = self.throttled_drain(Trigger::Manual).await;
                        let _ = reply.send(report);
                    }
                },
            }
        }

        info!("scheduler stopped");
    }

    async fn throttled_drain(&mut self, trigger: Trigger) -> DrainReport {
        if let Some(last) = self.last_drain {
            tokio::time::sleep_until(last + self.config.min_poll_interval).await;
        }
        self.last_drain = Some(Instant::now());

        let report = self.drain().await;
        if report.claimed > 0 || report.errors > 0 {
            info!(
                trigger = ?trigger,
                claimed = report.claimed,
                succeeded = report.succeeded,
                failed = report.failed,
                suspended = report.suspended,
                cancelled = report.cancelled,
                errors = report.errors,
                "drain finished"
            );
        } else {
            debug!(trigger = ?trigger, "nothing to drain");
        }
        report
    }

    async fn evict_expired(&self) {
        match self.engine.queue().evict_expired(self.config.retention).await {
            Ok(0) => {}
            Ok(n) => info!(evicted = n, "evicted expired jobs"),
            Err(e) => warn!(error = %e, "failed to evict expired jobs"),
        }
    }
}

/// Control handle for a running scheduler.
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    shutdown: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Drain now, bypassing the debounce, and report what happened.
    pub async fn sync_now(&self) -> Result<DrainReport, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SyncNow(tx))
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Stop the scheduler; a drain in progress runs to completion first.
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        self.shutdown.notify_one();
        self.task.await.map_err(|e| SchedulerError::Join(e.to_string()))
    }
}
