//! Failure taxonomy shared by the queue, the workflow engine and the UI.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An identifier failed to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid identifier: {0}")]
pub struct InvalidId(pub String);

/// Category of a job failure.
///
/// The category is chosen where the error is caught (inside a step or at a
/// collaborator boundary) and travels unchanged all the way to the UI so it
/// can offer category-appropriate remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Connectivity loss or timeout. Always retryable.
    Network,
    /// Throttled by an external service. Retryable with a longer backoff.
    RateLimited,
    /// Payload rejected as malformed. Terminal.
    Validation,
    /// The user dismissed a signing or consent prompt. Terminal.
    UserRejected,
    /// Local storage failed (quota, corruption). Terminal for the affected job.
    StorageUnavailable,
    /// Anything unclassified. One retry, then terminal.
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::RateLimited => "RATE_LIMITED",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::UserRejected => "USER_REJECTED",
            ErrorCategory::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }

    /// Whether a first failure of this category is worth an automatic retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::RateLimited | ErrorCategory::Unknown
        )
    }
}

impl core::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure: `(category, message, recoverable)`.
///
/// The queue never re-interprets `category`; it only looks at `recoverable`
/// and the job's attempt counter.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{category}: {message}")]
pub struct JobError {
    pub category: ErrorCategory,
    pub message: String,
    pub recoverable: bool,
}

impl JobError {
    /// Build an error whose `recoverable` flag follows the category default.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            recoverable: category.is_recoverable(),
        }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, msg)
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RateLimited, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, msg)
    }

    pub fn user_rejected(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::UserRejected, msg)
    }

    pub fn storage_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::StorageUnavailable, msg)
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unknown, msg)
    }

    /// Override the category default.
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }
}
