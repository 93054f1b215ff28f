//! Workflow definitions: an ordered, named list of async steps per job kind.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use verdant_core::{JobError, JobId, JobKind};

use crate::jobs::WorkflowState;

/// Everything a step gets to see.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub job_id: JobId,
    pub attempt: u32,
    pub payload: Value,
    pub state: WorkflowState,
}

/// One named unit of a workflow.
///
/// Steps must be safe to re-invoke after a partial failure of the same step:
/// the engine re-runs a failed step from scratch and does not track progress
/// inside it.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the step's side effect and return its output, which the
    /// engine records in the checkpoint under the step's name.
    async fn run(&self, input: StepInput) -> Result<Value, JobError>;

    /// Earlier step to go back to when this one fails terminally. The
    /// checkpoint is rewound to just before it, so a manual retry repeats
    /// that step instead of re-running this one against the same inputs.
    fn rewind_to(&self) -> Option<&str> {
        None
    }
}

/// A step backed by a closure.
pub struct FnStep<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnStep<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: StepInput) -> Result<Value, JobError> {
        (self.f)(input).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow for {0} has no steps")]
    Empty(JobKind),
    #[error("workflow for {kind} declares step '{step}' twice")]
    DuplicateStep { kind: JobKind, step: String },
    #[error("step '{step}' of {kind} rewinds to '{target}', which does not come before it")]
    InvalidRewind { kind: JobKind, step: String, target: String },
}

/// Static description of how a job kind is carried out.
///
/// The last step is terminal; its output is the job's result.
#[derive(Clone)]
pub struct WorkflowDefinition {
    kind: JobKind,
    steps: Vec<Arc<dyn Step>>,
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("kind", &self.kind)
            .field("steps", &self.step_names())
            .finish()
    }
}

impl WorkflowDefinition {
    pub fn new(kind: JobKind, steps: Vec<Arc<dyn Step>>) -> Result<Self, DefinitionError> {
        if steps.is_empty() {
            return Err(DefinitionError::Empty(kind));
        }
        let mut seen = HashSet::new();
        for step in &steps {
            if let Some(target) = step.rewind_to().filter(|target| !seen.contains(*target)) {
                return Err(DefinitionError::InvalidRewind {
                    kind,
                    step: step.name().to_string(),
                    target: target.to_string(),
                });
            }
            if !seen.insert(step.name().to_string()) {
                return Err(DefinitionError::DuplicateStep {
                    kind,
                    step: step.name().to_string(),
                });
            }
        }
        Ok(Self { kind, steps })
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&Arc<dyn Step>> {
        self.steps.get(index)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == name)
    }

    /// Checkpoint to record when the step at `index` fails terminally, if
    /// that step rewinds. Outputs of the target step and everything after it
    /// are dropped, and `rewinds` is bumped so the repeated steps can tell
    /// their new side effects apart from the abandoned ones.
    pub fn rewound(&self, state: &WorkflowState, index: usize) -> Option<WorkflowState> {
        let target = self.position(self.step(index)?.rewind_to()?)?;
        let mut rewound = state.clone();
        rewound.last_completed_step = target.checked_sub(1).map(|i| self.steps[i].name().to_string());
        rewound.completed_steps = target as u32;
        for step in &self.steps[target..] {
            rewound.outputs.remove(step.name());
        }
        rewound.result = None;
        rewound.rewinds += 1;
        Some(rewound)
    }

    /// Index of the step to run next given a checkpoint; `len()` when every
    /// step has completed.
    ///
    /// A checkpoint naming a step this definition does not have cannot be
    /// resumed safely and is reported as a terminal validation error.
    pub fn resume_index(&self, state: &WorkflowState) -> Result<usize, JobError> {
        match state.last_completed_step.as_deref() {
            None => Ok(0),
            Some(last) => self
                .position(last)
                .map(|i| i + 1)
                .ok_or_else(|| {
                    JobError::validation(format!(
                        "checkpoint names unknown step '{last}' for {}",
                        self.kind
                    ))
                }),
        }
    }
}

/// Job kind → definition.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<JobKind, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the definition for its kind.
    pub fn register(&mut self, definition: WorkflowDefinition) -> &mut Self {
        self.definitions.insert(definition.kind(), Arc::new(definition));
        self
    }

    pub fn with(mut self, definition: WorkflowDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(&kind).cloned()
    }
}
