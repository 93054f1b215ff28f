use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use verdant_core::{JobError, JobId, JobKind};

/// A versioned, immutable fact.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "job.enqueued").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred.
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobLifecycle {
    Enqueued,
    Started {
        attempt: u32,
    },
    /// A step finished and its checkpoint is durable.
    Checkpointed {
        step: String,
    },
    Succeeded {
        result: Option<Value>,
    },
    Failed {
        error: JobError,
        /// `true` when the job is `FAILED_RETRYABLE` and will be picked up again.
        will_retry: bool,
        next_eligible_at: Option<DateTime<Utc>>,
    },
    Cancelled,
    /// A terminally failed job was put back in the queue by the user.
    RetryRequested,
}

/// Lifecycle notification for UI consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobKind,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub lifecycle: JobLifecycle,
}

impl JobEvent {
    pub fn new(job_id: JobId, kind: JobKind, lifecycle: JobLifecycle) -> Self {
        Self {
            job_id,
            kind,
            occurred_at: Utc::now(),
            lifecycle,
        }
    }
}

impl Event for JobEvent {
    fn event_type(&self) -> &'static str {
        match self.lifecycle {
            JobLifecycle::Enqueued => "job.enqueued",
            JobLifecycle::Started { .. } => "job.started",
            JobLifecycle::Checkpointed { .. } => "job.checkpointed",
            JobLifecycle::Succeeded { .. } => "job.succeeded",
            JobLifecycle::Failed { .. } => "job.failed",
            JobLifecycle::Cancelled => "job.cancelled",
            JobLifecycle::RetryRequested => "job.retry_requested",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
