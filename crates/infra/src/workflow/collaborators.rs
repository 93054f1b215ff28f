//! Boundaries with the external services a workflow step talks to.
//!
//! Only the contracts live here. Each failure is classified at this boundary
//! into a `JobError` category; nothing upstream re-interprets it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use verdant_core::JobError;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("payload too large: {size} bytes exceeds {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("rejected as malformed: {0}")]
    Rejected(String),
    #[error("user rejected the request: {0}")]
    UserRejected(String),
    /// Relay or service-side failure; the request may succeed later.
    #[error("service error: {0}")]
    Service(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<CollaboratorError> for JobError {
    fn from(err: CollaboratorError) -> Self {
        let message = err.to_string();
        match err {
            CollaboratorError::Network(_) | CollaboratorError::Service(_) => JobError::network(message),
            CollaboratorError::RateLimited(_) => JobError::rate_limited(message),
            CollaboratorError::PayloadTooLarge { .. }
            | CollaboratorError::Rejected(_)
            | CollaboratorError::NotFound(_) => JobError::validation(message),
            CollaboratorError::UserRejected(_) => JobError::user_rejected(message),
        }
    }
}

/// Address returned by the content-addressed blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentAddress(pub String);

impl std::fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    /// Stable per-job key; lets a retried step find its earlier upload
    pub key: String,
    pub content_type: String,
    pub name: Option<String>,
}

/// Content-addressed blob store (media, metadata, allow-lists).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, metadata: &BlobMetadata) -> Result<ContentAddress, CollaboratorError>;

    /// Address of an earlier upload under `key`, if the store knows one.
    async fn lookup(&self, _key: &str) -> Result<Option<ContentAddress>, CollaboratorError> {
        Ok(None)
    }
}

/// Media captured on the device while offline.
#[async_trait]
pub trait MediaCache: Send + Sync {
    async fn read(&self, reference: &str) -> Result<Vec<u8>, CollaboratorError>;
}

/// A logical on-chain action handed to the smart-account signer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionIntent {
    pub idempotency_key: String,
    pub action: String,
    pub arguments: Value,
}

/// Handle for a submitted but not yet confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingReference(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransactionStatus {
    Confirmed { tx_hash: String },
    Failed { reason: String },
    Pending,
}

/// Smart-account signing and transaction relay.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn build_and_submit(&self, intent: &TransactionIntent) -> Result<PendingReference, CollaboratorError>;

    async fn get_status(&self, reference: &PendingReference) -> Result<TransactionStatus, CollaboratorError>;

    /// A transaction already relayed under `idempotency_key`, if any.
    async fn find_submitted(&self, _idempotency_key: &str) -> Result<Option<PendingReference>, CollaboratorError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationRequest {
    pub idempotency_key: String,
    pub schema: String,
    pub data: Value,
}

/// Attestation/ledger service; the final target of a work submission.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Returns the service's reference for the new attestation.
    async fn attest(&self, request: &AttestationRequest) -> Result<String, CollaboratorError>;

    async fn find_attestation(&self, _idempotency_key: &str) -> Result<Option<String>, CollaboratorError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdant_core::ErrorCategory;

    #[test]
    fn boundary_errors_map_to_categories() {
        let cases = [
            (CollaboratorError::Network("reset".into()), ErrorCategory::Network, true),
            (CollaboratorError::Service("502".into()), ErrorCategory::Network, true),
            (CollaboratorError::RateLimited("429".into()), ErrorCategory::RateLimited, true),
            (
                CollaboratorError::PayloadTooLarge { size: 10, limit: 5 },
                ErrorCategory::Validation,
                false,
            ),
            (CollaboratorError::UserRejected("closed".into()), ErrorCategory::UserRejected, false),
        ];

        for (err, category, recoverable) in cases {
            let job_err = JobError::from(err);
            assert_eq!(job_err.category, category);
            assert_eq!(job_err.recoverable, recoverable);
        }
    }
}
