//! Durable job queue.
//!
//! ## Design
//!
//! - Every job is one self-describing record in a [`DurableStore`]
//! - Transitions are conditional writes on the record's version
//! - Retry with exponential backoff, capped, until attempts run out
//! - `ACTIVE` jobs carry a lease; an expired lease makes the job claimable again
//!   and voids the previous executor's [`Claim`]
//!
//! ## Components
//!
//! - `Job`: record, status machine and checkpoint
//! - `DurableStore`: persistence (in-memory or SQLite)
//! - `JobQueue`: enqueue, claim, checkpoint, complete, fail, cancel, retry

pub mod queue;
pub mod record;
pub mod sqlite;
pub mod store;
pub mod types;

pub use queue::{CancelOutcome, JobQueue, QueueConfig, QueueError};
pub use sqlite::{SqliteJobStore, default_db_path};
pub use store::{DurableStore, InMemoryJobStore, Scan, StoreError, UnreadableRecord, WriteCondition};
pub use types::{Claim, InvalidTransition, Job, JobFilter, JobStats, JobStatus, RetryPolicy, WorkflowState};
