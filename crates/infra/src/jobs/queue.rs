//! The job queue: every job-state transition goes through here.
//!
//! Each operation is read → pure transition on a copy → conditional write
//! against the version that was read. A lost race surfaces as a store
//! `Conflict` and the operation starts over from a fresh read. No in-memory
//! lock is involved, so several queues (foreground and background contexts)
//! can drive the same storage safely.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use verdant_core::{JobError, JobId, JobKind};
use verdant_events::{EventBus, InMemoryEventBus, JobEvent, JobLifecycle, Subscription};

use super::store::{DurableStore, Scan, StoreError, UnreadableRecord, WriteCondition};
use super::types::{Claim, InvalidTransition, Job, JobFilter, JobStats, JobStatus, RetryPolicy, WorkflowState};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retry policy stamped onto new jobs and used for backoff
    pub retry_policy: RetryPolicy,
    /// How long a claim stays valid without a checkpoint
    pub lease_duration: Duration,
    /// Re-reads allowed per operation when a concurrent writer wins
    pub max_write_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            lease_duration: Duration::from_secs(300),
            max_write_retries: 8,
        }
    }
}

impl QueueConfig {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("job {0} kept changing underneath; gave up")]
    Contended(JobId),
    #[error("claim on job {0} was lost to another executor")]
    ClaimLost(JobId),
}

impl QueueError {
    /// Classified form for surfacing on a job or in the UI.
    pub fn to_job_error(&self) -> JobError {
        match self {
            QueueError::Store(e) => e.to_job_error(),
            other => JobError::unknown(other.to_string()).with_recoverable(false),
        }
    }
}

/// Result of a `cancel` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was removed from the store.
    Removed,
    /// The job is mid-step; it will be removed once that step settles.
    Deferred,
}

/// Durable job queue over a `DurableStore`.
pub struct JobQueue<S: DurableStore> {
    store: S,
    config: QueueConfig,
    bus: Arc<InMemoryEventBus<JobEvent>>,
}

impl<S: DurableStore> JobQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self::with_bus(store, config, Arc::new(InMemoryEventBus::new()))
    }

    /// Share an event bus with other queues over the same storage.
    pub fn with_bus(store: S, config: QueueConfig, bus: Arc<InMemoryEventBus<JobEvent>>) -> Self {
        Self { store, config, bus }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Receive lifecycle events. Delivery is best-effort.
    pub fn subscribe(&self) -> Subscription<JobEvent> {
        self.bus.subscribe()
    }

    fn publish(&self, job: &Job, lifecycle: JobLifecycle) {
        if let Err(e) = self.bus.publish(JobEvent::new(job.id, job.kind, lifecycle)) {
            warn!(job_id = %job.id, error = ?e, "failed to publish job event");
        }
    }

    /// Persist a new pending job. Never touches the network.
    pub async fn enqueue(&self, kind: JobKind, payload: Value) -> Result<Job, QueueError> {
        self.enqueue_with_priority(kind, payload, 0).await
    }

    pub async fn enqueue_with_priority(&self, kind: JobKind, payload: Value, priority: i32) -> Result<Job, QueueError> {
        let mut job = Job::new(kind, payload, self.config.retry_policy.max_attempts.max(1)).with_priority(priority);
        job.version = self.store.put(&job, WriteCondition::Create).await?;

        info!(job_id = %job.id, kind = %kind, priority, "job enqueued");
        self.publish(&job, JobLifecycle::Enqueued);
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    /// Dashboard listing, oldest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        Ok(self.scan(filter).await?.jobs)
    }

    /// Records that can no longer be decoded, each with the terminal
    /// `STORAGE_UNAVAILABLE` error it stands for.
    pub async fn unreadable(&self) -> Result<Vec<(UnreadableRecord, JobError)>, QueueError> {
        Ok(self
            .scan(&JobFilter::all())
            .await?
            .unreadable
            .into_iter()
            .map(|record| {
                let error = record.to_job_error();
                (record, error)
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        let scan = self.scan(&JobFilter::all()).await?;
        let mut stats = JobStats {
            unreadable: scan.unreadable.len(),
            ..JobStats::default()
        };
        for job in &scan.jobs {
            stats.record(job.status);
        }
        Ok(stats)
    }

    /// Full read; unreadable records are logged and left out of `jobs`.
    async fn scan(&self, filter: &JobFilter) -> Result<Scan, QueueError> {
        let scan = self.store.scan(filter).await?;
        for record in &scan.unreadable {
            let error = record.to_job_error();
            error!(
                record_id = %record.id,
                category = %error.category,
                reason = %record.reason,
                "skipping unreadable job record"
            );
        }
        Ok(scan)
    }

    /// Claim the next eligible job.
    ///
    /// Eligible: `PENDING`, `FAILED_RETRYABLE` past its backoff, or `ACTIVE`
    /// with an expired lease (its previous executor died). Higher priority
    /// first, then oldest first. The claim is a conditional write, so two
    /// callers racing for one job cannot both win; the loser moves on to
    /// the next candidate.
    pub async fn claim_next(&self, kinds: Option<&[JobKind]>) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let mut filter =
            JobFilter::all().with_statuses([JobStatus::Pending, JobStatus::FailedRetryable, JobStatus::Active]);
        if let Some(kinds) = kinds {
            filter = filter.with_kinds(kinds.iter().copied());
        }

        let mut candidates: Vec<Job> = self
            .scan(&filter)
            .await?
            .jobs
            .into_iter()
            .filter(|j| j.is_claimable(now))
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        for mut job in candidates {
            let expected = job.version;

            if job.status == JobStatus::Active && !job.has_attempts_left() {
                // Lease ran out on the final attempt: no attempt left to hand out.
                let error = JobError::network("lease expired during final attempt").with_recoverable(false);
                job.mark_failed(now, error.clone(), false, &self.config.retry_policy)?;
                match self.store.put(&job, WriteCondition::Version(expected)).await {
                    Ok(_) => {
                        warn!(job_id = %job.id, attempt = job.attempt, "abandoned job exhausted its attempts");
                        self.publish(
                            &job,
                            JobLifecycle::Failed {
                                error,
                                will_retry: false,
                                next_eligible_at: None,
                            },
                        );
                    }
                    Err(StoreError::Conflict(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            let reclaimed = job.status == JobStatus::Active;
            job.mark_active(now, self.config.lease_duration)?;
            match self.store.put(&job, WriteCondition::Version(expected)).await {
                Ok(version) => {
                    job.version = version;
                    if reclaimed {
                        warn!(job_id = %job.id, attempt = job.attempt, "reclaimed job with expired lease");
                    }
                    debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, "claimed job");
                    self.publish(&job, JobLifecycle::Started { attempt: job.attempt });
                    return Ok(Some(job));
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(job_id = %job.id, "lost claim race, trying next candidate");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    /// Read-modify-conditional-write loop shared by all single-job transitions.
    async fn transition<T, F>(&self, id: JobId, mut apply: F) -> Result<(Job, T), QueueError>
    where
        F: FnMut(&mut Job) -> Result<T, QueueError> + Send,
        T: Send,
    {
        for _ in 0..=self.config.max_write_retries {
            let mut job = self.store.get(id).await?.ok_or(QueueError::NotFound(id))?;
            let expected = job.version;
            let out = apply(&mut job)?;

            match self.store.put(&job, WriteCondition::Version(expected)).await {
                Ok(version) => {
                    job.version = version;
                    return Ok((job, out));
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(job_id = %id, "concurrent write, re-reading job");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(job_id = %id, "giving up after repeated write conflicts");
        Err(QueueError::Contended(id))
    }

    /// `transition` for the executor holding `claim`; refused with
    /// `ClaimLost` once the job was reclaimed or settled by someone else.
    async fn settle<T, F>(&self, claim: Claim, mut apply: F) -> Result<(Job, T), QueueError>
    where
        F: FnMut(&mut Job) -> Result<T, InvalidTransition> + Send,
        T: Send,
    {
        self.transition(claim.id(), move |job| {
            if !job.is_held_by(&claim) {
                return Err(QueueError::ClaimLost(claim.id()));
            }
            Ok(apply(job)?)
        })
        .await
    }

    /// Persist a checkpoint for an active job and renew its lease.
    ///
    /// The returned job tells the caller whether a cancellation arrived
    /// while the step was running.
    pub async fn checkpoint(&self, claim: Claim, state: WorkflowState) -> Result<Job, QueueError> {
        let id = claim.id();
        let lease = self.config.lease_duration;
        let (job, ()) = self
            .settle(claim, |job| job.mark_checkpoint(Utc::now(), state.clone(), lease))
            .await?;

        let step = job.workflow_state.last_completed_step.clone().unwrap_or_default();
        debug!(job_id = %id, step = %step, "checkpoint persisted");
        self.publish(&job, JobLifecycle::Checkpointed { step });
        Ok(job)
    }

    /// Mark an active job as done.
    pub async fn complete(&self, claim: Claim, result: Option<Value>) -> Result<Job, QueueError> {
        let id = claim.id();
        let (job, ()) = self
            .settle(claim, |job| job.mark_done(Utc::now(), result.clone()))
            .await?;

        if job.cancel_requested {
            info!(job_id = %id, "job finished before its cancellation could apply");
        }
        info!(job_id = %id, kind = %job.kind, attempt = job.attempt, "job succeeded");
        self.publish(
            &job,
            JobLifecycle::Succeeded {
                result: job.workflow_state.result.clone(),
            },
        );
        Ok(job)
    }

    /// Record a failure of an active job.
    ///
    /// Retryable failures with attempts left become `FAILED_RETRYABLE` with
    /// an exponential backoff; everything else becomes `FAILED_TERMINAL`.
    pub async fn fail(&self, claim: Claim, error: JobError, retryable: bool) -> Result<Job, QueueError> {
        self.record_failure(claim, error, retryable, None).await
    }

    /// Fail terminally and fall back to an earlier checkpoint in the same
    /// write, so a manual retry re-runs the steps `state` no longer covers.
    pub async fn fail_rewound(&self, claim: Claim, error: JobError, state: WorkflowState) -> Result<Job, QueueError> {
        self.record_failure(claim, error, false, Some(state)).await
    }

    async fn record_failure(
        &self,
        claim: Claim,
        error: JobError,
        retryable: bool,
        rewind: Option<WorkflowState>,
    ) -> Result<Job, QueueError> {
        let id = claim.id();
        let policy = self.config.retry_policy.clone();
        let (job, will_retry) = self
            .settle(claim, |job| {
                let now = Utc::now();
                if let Some(state) = &rewind {
                    job.mark_rewound(now, state.clone())?;
                }
                job.mark_failed(now, error.clone(), retryable, &policy)
            })
            .await?;

        if rewind.is_some() {
            info!(
                job_id = %id,
                step = ?job.workflow_state.last_completed_step,
                "checkpoint rewound for manual retry"
            );
        }

        if will_retry {
            warn!(
                job_id = %id,
                attempt = job.attempt,
                category = %error.category,
                error = %error.message,
                next_eligible_at = ?job.next_eligible_at,
                "job failed, retry scheduled"
            );
        } else {
            warn!(
                job_id = %id,
                attempt = job.attempt,
                category = %error.category,
                error = %error.message,
                "job failed terminally"
            );
        }
        self.publish(
            &job,
            JobLifecycle::Failed {
                error,
                will_retry,
                next_eligible_at: job.next_eligible_at,
            },
        );

        if job.cancel_requested {
            self.apply_deferred_cancel(id).await?;
        }
        Ok(job)
    }

    /// Return an active job to the queue without consuming its attempt.
    pub async fn suspend(&self, claim: Claim) -> Result<Job, QueueError> {
        let id = claim.id();
        let (job, ()) = self.settle(claim, |job| job.mark_suspended(Utc::now())).await?;

        info!(job_id = %id, step = ?job.workflow_state.last_completed_step, "job suspended");
        if job.cancel_requested {
            self.apply_deferred_cancel(id).await?;
        } else {
            self.publish(
                &job,
                JobLifecycle::Failed {
                    error: JobError::network("suspended while offline"),
                    will_retry: true,
                    next_eligible_at: job.next_eligible_at,
                },
            );
        }
        Ok(job)
    }

    /// Cancel a job.
    ///
    /// `PENDING` and `FAILED_TERMINAL` jobs are removed. An `ACTIVE` job has
    /// the request recorded and is removed once its current step settles.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, QueueError> {
        for _ in 0..=self.config.max_write_retries {
            let job = self.store.get(id).await?.ok_or(QueueError::NotFound(id))?;

            if job.is_cancellable() {
                match self.store.delete(id, Some(job.version)).await {
                    Ok(_) => {
                        info!(job_id = %id, "job cancelled");
                        self.publish(&job, JobLifecycle::Cancelled);
                        return Ok(CancelOutcome::Removed);
                    }
                    Err(StoreError::Conflict(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            if job.status != JobStatus::Active {
                return Err(InvalidTransition {
                    id,
                    from: job.status,
                    op: "cancel",
                }
                .into());
            }

            let mut requested = job.clone();
            requested.mark_cancel_requested(Utc::now())?;
            match self.store.put(&requested, WriteCondition::Version(job.version)).await {
                Ok(_) => {
                    info!(job_id = %id, "cancellation deferred until the current step settles");
                    return Ok(CancelOutcome::Deferred);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(QueueError::Contended(id))
    }

    /// Remove a job whose cancellation was deferred. Returns whether it was
    /// removed.
    pub async fn apply_deferred_cancel(&self, id: JobId) -> Result<bool, QueueError> {
        for _ in 0..=self.config.max_write_retries {
            let Some(job) = self.store.get(id).await? else {
                return Ok(false);
            };
            if !job.cancel_requested || job.status == JobStatus::Done {
                return Ok(false);
            }
            match self.store.delete(id, Some(job.version)).await {
                Ok(removed) => {
                    if removed {
                        info!(job_id = %id, "deferred cancellation applied");
                        self.publish(&job, JobLifecycle::Cancelled);
                    }
                    return Ok(removed);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(QueueError::Contended(id))
    }

    /// Manual retry of a terminally failed job: fresh attempt counter and
    /// failure history, checkpoint kept.
    pub async fn retry(&self, id: JobId) -> Result<Job, QueueError> {
        let (job, ()) = self
            .transition(id, |job| Ok(job.mark_retry_requested(Utc::now())?))
            .await?;

        info!(job_id = %id, step = ?job.workflow_state.last_completed_step, "manual retry requested");
        self.publish(&job, JobLifecycle::RetryRequested);
        Ok(job)
    }

    /// Delete `DONE` jobs older than `retention`. Returns how many went.
    pub async fn evict_expired(&self, retention: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
        let done = self
            .scan(&JobFilter::all().with_statuses([JobStatus::Done]))
            .await?
            .jobs;

        let mut evicted = 0;
        for job in done.into_iter().filter(|j| j.updated_at <= cutoff) {
            match self.store.delete(job.id, Some(job.version)).await {
                Ok(true) => evicted += 1,
                Ok(false) | Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if evicted > 0 {
            debug!(evicted, "evicted completed jobs past retention");
        }
        Ok(evicted)
    }
}
