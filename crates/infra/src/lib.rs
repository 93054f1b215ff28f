//! Infrastructure layer: durable job storage, the job queue and the
//! workflow engine.

pub mod jobs;
pub mod workflow;

pub use jobs::{DurableStore, InMemoryJobStore, Job, JobQueue, JobStatus, QueueConfig, QueueError, SqliteJobStore};
pub use workflow::{EngineConfig, RunOutcome, StepGate, WorkflowEngine, WorkflowRegistry};
