//! Resumable step runner.
//!
//! For a claimed job, the engine finds the step after the checkpoint's
//! `last_completed_step`, runs it, and persists the advanced checkpoint
//! before looking at the next step. A crash at any point therefore re-enters
//! at the first step whose side effect was not confirmed. A failed step leaves
//! the checkpoint untouched, so its retry re-runs that same step, unless the
//! step fails terminally and names an earlier step to rewind to.
//!
//! Every write goes through the job's [`Claim`]. If the lease ran out and
//! another executor reclaimed the job, this run's writes are refused.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use verdant_core::{ErrorCategory, JobError};

use crate::jobs::{Claim, DurableStore, Job, JobQueue, JobStatus, QueueError, WorkflowState};

use super::definition::{StepInput, WorkflowRegistry};

/// Decides whether a new step may start (e.g. only while online).
///
/// Checked before each step; a step already running is never interrupted.
pub trait StepGate: Send + Sync {
    fn may_start_step(&self) -> bool;
}

/// Gate that never closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl StepGate for AlwaysOpen {
    fn may_start_step(&self) -> bool {
        true
    }
}

impl StepGate for AtomicBool {
    fn may_start_step(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

impl<G: StepGate + ?Sized> StepGate for Arc<G> {
    fn may_start_step(&self) -> bool {
        (**self).may_start_step()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum wait for any single step
    pub step_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(120),
        }
    }
}

impl EngineConfig {
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }
}

/// How a run of the engine over one claimed job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { result: Option<Value> },
    Failed { error: JobError, will_retry: bool },
    /// The gate closed before the next step; the job went back to the queue.
    Suspended,
    /// A cancellation requested mid-step was applied.
    Cancelled,
}

pub struct WorkflowEngine<S: DurableStore> {
    queue: Arc<JobQueue<S>>,
    registry: Arc<WorkflowRegistry>,
    config: EngineConfig,
}

impl<S: DurableStore> WorkflowEngine<S> {
    pub fn new(queue: Arc<JobQueue<S>>, registry: WorkflowRegistry, config: EngineConfig) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue<S>> {
        &self.queue
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Drive a job claimed via `JobQueue::claim_next` as far as it will go.
    ///
    /// `Err` means the queue itself could not record the outcome (storage
    /// down, or the claim was lost to another executor); the job record is
    /// still in the store and will be picked up again once its lease expires.
    pub async fn run(&self, job: Job, gate: &dyn StepGate) -> Result<RunOutcome, QueueError> {
        let claim = job.claim().ok_or(QueueError::ClaimLost(job.id))?;
        if job.cancel_requested && self.queue.apply_deferred_cancel(job.id).await? {
            return Ok(RunOutcome::Cancelled);
        }

        let Some(definition) = self.registry.get(job.kind) else {
            let error = JobError::validation(format!("no workflow registered for {}", job.kind));
            return self.fail(&job, claim, error, None).await;
        };

        let mut index = match definition.resume_index(&job.workflow_state) {
            Ok(index) => index,
            Err(error) => return self.fail(&job, claim, error, None).await,
        };
        let mut state = job.workflow_state.clone();

        if index > 0 {
            debug!(job_id = %job.id, resume_at = index, steps = definition.len(), "resuming from checkpoint");
        }

        while let Some(step) = definition.step(index) {
            if !gate.may_start_step() {
                info!(job_id = %job.id, step = step.name(), "gate closed, suspending before step");
                let suspended = self.queue.suspend(claim).await?;
                if suspended.cancel_requested {
                    return Ok(RunOutcome::Cancelled);
                }
                return Ok(RunOutcome::Suspended);
            }

            debug!(job_id = %job.id, step = step.name(), attempt = job.attempt, "running step");
            let input = StepInput {
                job_id: job.id,
                attempt: job.attempt,
                payload: job.payload.clone(),
                state: state.clone(),
            };

            let output = match tokio::time::timeout(self.config.step_timeout, step.run(input)).await {
                Ok(Ok(output)) => output,
                Ok(Err(error)) => {
                    let rewind = definition.rewound(&state, index);
                    return self.fail(&job, claim, error, rewind).await;
                }
                Err(_) => {
                    let error = JobError::network(format!(
                        "step '{}' timed out after {:?}",
                        step.name(),
                        self.config.step_timeout
                    ));
                    return self.fail(&job, claim, error, None).await;
                }
            };

            let mut next = state.advanced(index, step.name(), output.clone());
            if index + 1 == definition.len() {
                next.result = Some(output);
            }

            let saved = match self.queue.checkpoint(claim, next).await {
                Ok(saved) => saved,
                Err(QueueError::Store(err)) => {
                    error!(job_id = %job.id, step = step.name(), error = %err, "failed to persist checkpoint");
                    return self.fail(&job, claim, err.to_job_error(), None).await;
                }
                Err(err) => {
                    warn!(job_id = %job.id, step = step.name(), error = %err, "lost ownership of job");
                    return Err(err);
                }
            };
            state = saved.workflow_state.clone();

            if saved.cancel_requested && index + 1 < definition.len() {
                self.queue.apply_deferred_cancel(job.id).await?;
                return Ok(RunOutcome::Cancelled);
            }
            index += 1;
        }

        let done = self.queue.complete(claim, state.result.clone()).await?;
        Ok(RunOutcome::Completed {
            result: done.workflow_state.result,
        })
    }

    /// Record `error`. `rewind` only applies when the failure is terminal.
    async fn fail(
        &self,
        job: &Job,
        claim: Claim,
        error: JobError,
        rewind: Option<WorkflowState>,
    ) -> Result<RunOutcome, QueueError> {
        let recoverable = error.recoverable && !repeated_unknown(job, &error);
        let failed = match rewind.filter(|_| !recoverable) {
            Some(state) => self.queue.fail_rewound(claim, error.clone(), state).await,
            None => self.queue.fail(claim, error.clone(), recoverable).await,
        };
        let failed = failed.inspect_err(|err| {
            if matches!(err, QueueError::ClaimLost(_)) {
                warn!(job_id = %job.id, error = %err, "lost ownership of job before recording failure");
            }
        })?;
        if failed.cancel_requested {
            return Ok(RunOutcome::Cancelled);
        }
        Ok(RunOutcome::Failed {
            error,
            will_retry: failed.status == JobStatus::FailedRetryable,
        })
    }
}

/// `UNKNOWN` gets one automatic retry: a second consecutive one is terminal.
/// Suspensions do not break the chain; a manual retry starts a new one.
fn repeated_unknown(job: &Job, error: &JobError) -> bool {
    error.category == ErrorCategory::Unknown
        && job
            .last_error
            .as_ref()
            .is_some_and(|e| e.category == ErrorCategory::Unknown)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::jobs::{InMemoryJobStore, QueueConfig, RetryPolicy};
    use crate::workflow::definition::{FnStep, Step, WorkflowDefinition};
    use verdant_core::JobKind;
    use verdant_events::JobLifecycle;

    type Queue = Arc<JobQueue<InMemoryJobStore>>;

    fn queue(max_attempts: u32) -> Queue {
        Arc::new(JobQueue::new(
            InMemoryJobStore::new(),
            QueueConfig::default().with_retry_policy(RetryPolicy::exponential(
                max_attempts,
                Duration::from_millis(1),
                Duration::from_millis(5),
            )),
        ))
    }

    /// A step that counts invocations and fails while `failures` is non-zero.
    fn spy(name: &'static str, calls: Arc<AtomicUsize>, failures: Arc<AtomicUsize>, error: JobError) -> Arc<dyn Step> {
        Arc::new(FnStep::new(name, move |_input: StepInput| {
            let calls = calls.clone();
            let failures = failures.clone();
            let error = error.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if failures.load(Ordering::SeqCst) > 0 {
                    failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(error);
                }
                Ok(json!(format!("{name}-out")))
            }
        }))
    }

    fn counters(n: usize) -> Vec<Arc<AtomicUsize>> {
        (0..n).map(|_| Arc::new(AtomicUsize::new(0))).collect()
    }

    fn engine(queue: &Queue, steps: Vec<Arc<dyn Step>>) -> WorkflowEngine<InMemoryJobStore> {
        let registry = WorkflowRegistry::new().with(WorkflowDefinition::new(JobKind::MintCertificate, steps).unwrap());
        WorkflowEngine::new(
            queue.clone(),
            registry,
            EngineConfig::default().with_step_timeout(Duration::from_millis(200)),
        )
    }

    async fn claim(queue: &Queue) -> Job {
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.claim_next(None).await.unwrap().expect("eligible job")
    }

    #[tokio::test]
    async fn runs_every_step_and_completes_with_terminal_output() {
        let queue = queue(3);
        let calls = counters(3);
        let none = counters(3);
        let steps = vec![
            spy("a", calls[0].clone(), none[0].clone(), JobError::network("x")),
            spy("b", calls[1].clone(), none[1].clone(), JobError::network("x")),
            spy("c", calls[2].clone(), none[2].clone(), JobError::network("x")),
        ];
        let engine = engine(&queue, steps);
        let events = queue.subscribe();

        let job = queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();
        let outcome = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed { result: Some(json!("c-out")) });
        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.workflow_state.last_completed_step.as_deref(), Some("c"));

        let checkpoints: Vec<String> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e.lifecycle {
                JobLifecycle::Checkpointed { step } => Some(step),
                _ => None,
            })
            .collect();
        assert_eq!(checkpoints, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn retry_resumes_at_the_failed_step() {
        let queue = queue(3);
        let calls = counters(3);
        let failures = counters(3);
        failures[1].store(1, Ordering::SeqCst);
        let steps = vec![
            spy("a", calls[0].clone(), failures[0].clone(), JobError::network("x")),
            spy("b", calls[1].clone(), failures[1].clone(), JobError::network("relay down")),
            spy("c", calls[2].clone(), failures[2].clone(), JobError::network("x")),
        ];
        let engine = engine(&queue, steps);
        let job = queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();

        let first = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(first, RunOutcome::Failed { will_retry: true, .. }));
        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::FailedRetryable);
        assert_eq!(stored.workflow_state.last_completed_step.as_deref(), Some("a"));

        let second = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(second, RunOutcome::Completed { .. }));

        assert_eq!(calls[0].load(Ordering::SeqCst), 1);
        assert_eq!(calls[1].load(Ordering::SeqCst), 2);
        assert_eq!(calls[2].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_step_error_fails_without_retry() {
        let queue = queue(5);
        let calls = counters(1);
        let failures = counters(1);
        failures[0].store(1, Ordering::SeqCst);
        let engine = engine(
            &queue,
            vec![spy("a", calls[0].clone(), failures[0].clone(), JobError::user_rejected("dismissed"))],
        );
        let job = queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();

        let outcome = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { will_retry: false, .. }));
        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::FailedTerminal);
        assert_eq!(stored.last_error.unwrap().category, ErrorCategory::UserRejected);
    }

    #[tokio::test]
    async fn unknown_errors_get_exactly_one_retry() {
        let queue = queue(5);
        let calls = counters(1);
        let failures = counters(1);
        failures[0].store(10, Ordering::SeqCst);
        let engine = engine(
            &queue,
            vec![spy("a", calls[0].clone(), failures[0].clone(), JobError::unknown("boom"))],
        );
        let job = queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();

        let first = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(first, RunOutcome::Failed { will_retry: true, .. }));
        let second = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(second, RunOutcome::Failed { will_retry: false, .. }));

        assert_eq!(queue.get(job.id).await.unwrap().unwrap().status, JobStatus::FailedTerminal);
        assert_eq!(calls[0].load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn manual_retry_restores_the_unknown_retry() {
        let queue = queue(5);
        let calls = counters(1);
        let failures = counters(1);
        failures[0].store(3, Ordering::SeqCst);
        let engine = engine(
            &queue,
            vec![spy("a", calls[0].clone(), failures[0].clone(), JobError::unknown("boom"))],
        );
        let job = queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();

        engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        let second = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(second, RunOutcome::Failed { will_retry: false, .. }));

        queue.retry(job.id).await.unwrap();
        let third = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(third, RunOutcome::Failed { will_retry: true, .. }));
        let fourth = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(fourth, RunOutcome::Completed { .. }));
        assert_eq!(calls[0].load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn suspension_does_not_reset_the_unknown_chain() {
        let queue = queue(5);
        let calls = counters(1);
        let failures = counters(1);
        failures[0].store(10, Ordering::SeqCst);
        let engine = engine(
            &queue,
            vec![spy("a", calls[0].clone(), failures[0].clone(), JobError::unknown("boom"))],
        );
        queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();

        let first = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(first, RunOutcome::Failed { will_retry: true, .. }));
        let offline = AtomicBool::new(false);
        assert_eq!(engine.run(claim(&queue).await, &offline).await.unwrap(), RunOutcome::Suspended);

        let third = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(third, RunOutcome::Failed { will_retry: false, .. }));
        assert_eq!(calls[0].load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reclaimed_lease_fences_the_slow_executor() {
        let queue: Queue = Arc::new(JobQueue::new(
            InMemoryJobStore::new(),
            QueueConfig::default()
                .with_retry_policy(RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(5)))
                .with_lease_duration(Duration::from_millis(50)),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let slow: Arc<dyn Step> = Arc::new(FnStep::new("submit-transaction", move |input: StepInput| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if input.attempt == 1 {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                }
                Ok::<_, JobError>(json!(format!("attempt-{}", input.attempt)))
            }
        }));
        let engine = engine(&queue, vec![slow]);
        let job = queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();
        let first = queue.claim_next(None).await.unwrap().unwrap();

        let (stale, reclaimed) = tokio::join!(engine.run(first, &AlwaysOpen), async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            queue.claim_next(None).await.unwrap()
        });
        assert!(matches!(stale, Err(QueueError::ClaimLost(id)) if id == job.id));
        let reclaimed = reclaimed.expect("expired lease is claimable");
        assert_eq!(reclaimed.attempt, 2);

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert!(stored.is_held_by(&reclaimed.claim().unwrap()));
        assert!(stored.workflow_state.last_completed_step.is_none());

        let outcome = engine.run(reclaimed, &AlwaysOpen).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { result: Some(json!("attempt-2")) });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn step_timeout_is_a_retryable_network_failure() {
        let queue = queue(3);
        let slow: Arc<dyn Step> = Arc::new(FnStep::new("await-confirmation", |_input: StepInput| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, JobError>(json!(null))
        }));
        let engine = engine(&queue, vec![slow]);
        queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();

        match engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap() {
            RunOutcome::Failed { error, will_retry } => {
                assert_eq!(error.category, ErrorCategory::Network);
                assert!(error.message.contains("timed out"));
                assert!(will_retry);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_gate_suspends_before_the_next_step() {
        let queue = queue(3);
        let calls = counters(2);
        let none = counters(2);
        let engine = engine(
            &queue,
            vec![
                spy("a", calls[0].clone(), none[0].clone(), JobError::network("x")),
                spy("b", calls[1].clone(), none[1].clone(), JobError::network("x")),
            ],
        );
        let job = queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();

        let offline = AtomicBool::new(false);
        let outcome = engine.run(claim(&queue).await, &offline).await.unwrap();
        assert_eq!(outcome, RunOutcome::Suspended);
        assert_eq!(calls[0].load(Ordering::SeqCst), 0);

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::FailedRetryable);
        assert_eq!(stored.attempt, 0);
    }

    #[tokio::test]
    async fn missing_definition_is_terminal() {
        let queue = queue(3);
        let engine = WorkflowEngine::new(queue.clone(), WorkflowRegistry::new(), EngineConfig::default());
        let job = queue.enqueue(JobKind::SubmitWork, json!({})).await.unwrap();

        let outcome = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { will_retry: false, .. }));
        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.last_error.unwrap().category, ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn cancellation_during_a_step_applies_after_its_checkpoint() {
        let queue = queue(3);
        let q = queue.clone();
        let cancelling: Arc<dyn Step> = Arc::new(FnStep::new("upload-metadata", move |input: StepInput| {
            let q = q.clone();
            async move {
                q.cancel(input.job_id).await.map_err(|e| e.to_job_error())?;
                Ok::<_, JobError>(json!("cid-1"))
            }
        }));
        let calls = counters(1);
        let none = counters(1);
        let engine = engine(
            &queue,
            vec![cancelling, spy("upload-allowlist", calls[0].clone(), none[0].clone(), JobError::network("x"))],
        );
        let job = queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();

        let outcome = engine.run(claim(&queue).await, &AlwaysOpen).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(calls[0].load(Ordering::SeqCst), 0);
        assert!(queue.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn storage_failure_keeps_the_job_record() {
        let queue = queue(3);
        let q = queue.clone();
        let breaking: Arc<dyn Step> = Arc::new(FnStep::new("upload-metadata", move |_input: StepInput| {
            let q = q.clone();
            async move {
                q.store().set_unavailable(true);
                Ok::<_, JobError>(json!("cid-1"))
            }
        }));
        let engine = engine(&queue, vec![breaking]);
        let job = queue.enqueue(JobKind::MintCertificate, json!({})).await.unwrap();

        let result = engine.run(claim(&queue).await, &AlwaysOpen).await;
        assert!(matches!(result, Err(QueueError::Store(_))));

        queue.store().set_unavailable(false);
        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert!(stored.workflow_state.last_completed_step.is_none());
    }
}
