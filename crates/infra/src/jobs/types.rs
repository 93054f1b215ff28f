//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use verdant_core::{ErrorCategory, JobError, JobId, JobKind};

/// Job lifecycle status.
///
/// `PENDING → ACTIVE → {DONE, FAILED_RETRYABLE → ACTIVE, FAILED_TERMINAL}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one executor
    Active,
    /// Workflow finished; evicted after the retention window
    Done,
    /// Failed, will be retried once `next_eligible_at` passes
    FailedRetryable,
    /// Needs user intervention (manual retry or cancel)
    FailedTerminal,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Active,
        JobStatus::Done,
        JobStatus::FailedRetryable,
        JobStatus::FailedTerminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Active => "ACTIVE",
            JobStatus::Done => "DONE",
            JobStatus::FailedRetryable => "FAILED_RETRYABLE",
            JobStatus::FailedTerminal => "FAILED_TERMINAL",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of processing attempts, including the first one
    pub max_attempts: u32,
    /// Base delay; the n-th attempt's failure waits `base * 2^n`
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0), added on top of the exponential delay
    pub jitter: f64,
    /// Multiplier applied to the delay for `RATE_LIMITED` failures
    pub rate_limit_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            jitter: 0.1,
            rate_limit_factor: 4,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff and no jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before a job that just failed its `attempt`-th attempt becomes
    /// eligible again.
    ///
    /// `base * 2^attempt` plus up to `jitter` of that, capped at `max_delay`.
    /// Jitter is derived from `seed` (the job id), so two jobs failing in
    /// lockstep spread out while one job's schedule stays reproducible.
    pub fn delay_for_attempt(&self, attempt: u32, category: ErrorCategory, seed: u128) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let mut delay_ms = base_ms * 2_f64.powi(attempt.min(62) as i32);
        if category == ErrorCategory::RateLimited {
            delay_ms *= self.rate_limit_factor.max(1) as f64;
        }

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let mixed = seed ^ (u128::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let fraction = (mixed % 1000) as f64 / 1000.0;
            delay_ms += delay_ms * jitter * fraction;
        }

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }
}

/// Resumption checkpoint written by the workflow engine.
///
/// The queue treats it as opaque apart from `completed_steps`, which it uses
/// to refuse checkpoints that would move backwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// Name of the last step whose side effect is confirmed
    pub last_completed_step: Option<String>,
    /// Number of steps completed so far (index of the next step)
    #[serde(default)]
    pub completed_steps: u32,
    /// Output of each completed step, keyed by step name
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Externally observable result, set by the terminal step
    #[serde(default)]
    pub result: Option<Value>,
    /// Times a terminal failure sent the workflow back to an earlier step
    #[serde(default)]
    pub rewinds: u32,
}

impl WorkflowState {
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }

    /// State after `step` (at `index`) produced `output`.
    pub fn advanced(&self, index: usize, step: &str, output: Value) -> Self {
        let mut next = self.clone();
        next.last_completed_step = Some(step.to_string());
        next.completed_steps = index as u32 + 1;
        next.outputs.insert(step.to_string(), output);
        next
    }
}

/// Ownership of one claim on a job, as handed out by `claim_next`.
///
/// Completing, failing, checkpointing and suspending require the claim that
/// is currently recorded on the job. Once an expired lease is reclaimed, the
/// previous executor's claim no longer matches and its writes are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Claim {
    id: JobId,
    token: Uuid,
}

impl Claim {
    pub fn id(&self) -> JobId {
        self.id
    }
}

/// A transition was attempted from a status that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {op} job {id} while {from}")]
pub struct InvalidTransition {
    pub id: JobId,
    pub from: JobStatus,
    pub op: &'static str,
}

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job ID (store key)
    pub id: JobId,
    /// Selects the workflow definition
    pub kind: JobKind,
    /// Immutable input captured at enqueue time
    pub payload: Value,
    pub status: JobStatus,
    /// Processing attempts started so far
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<JobError>,
    pub workflow_state: WorkflowState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Higher is claimed first
    pub priority: i32,
    /// Backoff deadline while `FAILED_RETRYABLE`
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Claim deadline while `ACTIVE`
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Identifies the current claim while `ACTIVE`
    #[serde(default)]
    pub lease_token: Option<Uuid>,
    /// Cancellation requested while a step was in flight
    pub cancel_requested: bool,
    /// Store-managed record version (0 = never persisted)
    pub version: u64,
}

impl Job {
    /// Create a new pending job.
    pub fn new(kind: JobKind, payload: Value, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            payload,
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts,
            last_error: None,
            workflow_state: WorkflowState::default(),
            created_at: now,
            updated_at: now,
            priority: 0,
            next_eligible_at: None,
            lease_expires_at: None,
            lease_token: None,
            cancel_requested: false,
            version: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether `claim_next` may hand this job out at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::FailedRetryable => self.next_eligible_at.is_none_or(|at| at <= now),
            JobStatus::Active => self.lease_expires_at.is_some_and(|at| at <= now),
            JobStatus::Done | JobStatus::FailedTerminal => false,
        }
    }

    /// The claim an executor must present to settle the current attempt.
    pub fn claim(&self) -> Option<Claim> {
        match (self.status, self.lease_token) {
            (JobStatus::Active, Some(token)) => Some(Claim { id: self.id, token }),
            _ => None,
        }
    }

    pub fn is_held_by(&self, claim: &Claim) -> bool {
        self.claim().as_ref() == Some(claim)
    }

    /// Whether the attempt bound leaves room for another attempt.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    fn invalid(&self, op: &'static str) -> InvalidTransition {
        InvalidTransition {
            id: self.id,
            from: self.status,
            op,
        }
    }

    fn require_active(&self, op: &'static str) -> Result<(), InvalidTransition> {
        if self.status == JobStatus::Active {
            Ok(())
        } else {
            Err(self.invalid(op))
        }
    }

    /// Mark job as active under a fresh lease.
    pub fn mark_active(&mut self, now: DateTime<Utc>, lease: Duration) -> Result<(), InvalidTransition> {
        if !self.is_claimable(now) {
            return Err(self.invalid("claim"));
        }
        self.status = JobStatus::Active;
        self.attempt += 1;
        self.next_eligible_at = None;
        self.lease_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
        self.lease_token = Some(Uuid::now_v7());
        self.updated_at = now;
        Ok(())
    }

    /// Record a completed step and renew the lease.
    pub fn mark_checkpoint(
        &mut self,
        now: DateTime<Utc>,
        state: WorkflowState,
        lease: Duration,
    ) -> Result<(), InvalidTransition> {
        self.require_active("checkpoint")?;
        if state.completed_steps <= self.workflow_state.completed_steps {
            return Err(self.invalid("move the checkpoint backwards on"));
        }
        self.workflow_state = state;
        self.lease_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
        self.updated_at = now;
        Ok(())
    }

    /// Mark job as done.
    pub fn mark_done(&mut self, now: DateTime<Utc>, result: Option<Value>) -> Result<(), InvalidTransition> {
        self.require_active("complete")?;
        self.status = JobStatus::Done;
        self.last_error = None;
        self.lease_expires_at = None;
        self.lease_token = None;
        if result.is_some() {
            self.workflow_state.result = result;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Mark job as failed; returns `true` if a retry was scheduled.
    pub fn mark_failed(
        &mut self,
        now: DateTime<Utc>,
        error: JobError,
        retryable: bool,
        policy: &RetryPolicy,
    ) -> Result<bool, InvalidTransition> {
        self.require_active("fail")?;
        self.lease_expires_at = None;
        self.lease_token = None;
        self.updated_at = now;

        let will_retry = retryable && self.has_attempts_left();
        if will_retry {
            let delay = policy.delay_for_attempt(self.attempt, error.category, self.id.as_uuid().as_u128());
            self.status = JobStatus::FailedRetryable;
            self.next_eligible_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        } else {
            self.status = JobStatus::FailedTerminal;
            self.next_eligible_at = None;
        }
        self.last_error = Some(error);
        Ok(will_retry)
    }

    /// Replace the checkpoint with an earlier one, so the steps it no longer
    /// covers run again.
    pub fn mark_rewound(&mut self, now: DateTime<Utc>, state: WorkflowState) -> Result<(), InvalidTransition> {
        self.require_active("rewind")?;
        if state.completed_steps > self.workflow_state.completed_steps {
            return Err(self.invalid("rewind the checkpoint forwards on"));
        }
        self.workflow_state = state;
        self.updated_at = now;
        Ok(())
    }

    /// Hand an active job back without consuming its attempt.
    ///
    /// Used when connectivity drops before the next step starts; the job is
    /// immediately eligible and resumes from its checkpoint. `last_error`
    /// still describes the last real failure.
    pub fn mark_suspended(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.require_active("suspend")?;
        self.status = JobStatus::FailedRetryable;
        self.attempt = self.attempt.saturating_sub(1);
        self.next_eligible_at = Some(now);
        self.lease_expires_at = None;
        self.lease_token = None;
        self.updated_at = now;
        Ok(())
    }

    /// Move a terminally failed job back to pending with a fresh attempt
    /// counter and no failure history. The checkpoint is kept so the retry
    /// resumes.
    pub fn mark_retry_requested(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::FailedTerminal {
            return Err(self.invalid("retry"));
        }
        self.status = JobStatus::Pending;
        self.attempt = 0;
        self.last_error = None;
        self.next_eligible_at = None;
        self.cancel_requested = false;
        self.updated_at = now;
        Ok(())
    }

    /// Record a cancellation to apply once the in-flight step settles.
    pub fn mark_cancel_requested(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.require_active("defer cancellation of")?;
        self.cancel_requested = true;
        self.updated_at = now;
        Ok(())
    }

    /// Whether `cancel` may remove the job right away.
    pub fn is_cancellable(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::FailedTerminal)
    }
}

/// Selection for `list`/`get_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub statuses: Option<Vec<JobStatus>>,
    pub kinds: Option<Vec<JobKind>>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = JobKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.statuses.as_ref().is_none_or(|s| s.contains(&job.status))
            && self.kinds.as_ref().is_none_or(|k| k.contains(&job.kind))
    }
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub active: usize,
    pub done: usize,
    pub failed_retryable: usize,
    pub failed_terminal: usize,
    /// Records that no longer decode; each counts as a terminal
    /// `STORAGE_UNAVAILABLE` failure of its job
    pub unreadable: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::FailedRetryable => self.failed_retryable += 1,
            JobStatus::FailedTerminal => self.failed_terminal += 1,
        }
    }
}
