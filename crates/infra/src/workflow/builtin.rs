//! Workflows shipped with the queue: work submission and certificate mint.
//!
//! Every step derives an idempotency key from the job id, so a step re-run
//! after a crash finds the side effect it already produced instead of
//! producing it twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use verdant_core::{JobError, JobId, JobKind};

use super::collaborators::{
    AttestationRequest, BlobMetadata, BlobStore, ContentAddress, Ledger, MediaCache, PendingReference, Signer,
    TransactionIntent, TransactionStatus,
};
use super::definition::{DefinitionError, Step, StepInput, WorkflowDefinition, WorkflowRegistry};

pub const UPLOAD_MEDIA: &str = "upload-media";
pub const SUBMIT_ATTESTATION: &str = "submit-attestation";
pub const UPLOAD_METADATA: &str = "upload-metadata";
pub const UPLOAD_ALLOWLIST: &str = "upload-allowlist";
pub const SUBMIT_TRANSACTION: &str = "submit-transaction";
pub const AWAIT_CONFIRMATION: &str = "await-confirmation";

const WORK_SCHEMA: &str = "work-submission/v1";

/// Payload of a `submit-work` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSubmission {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// References into the local media cache
    #[serde(default)]
    pub media: Vec<String>,
}

/// Payload of a `mint-certificate` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateMint {
    pub name: String,
    pub recipient: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub allowlist: Vec<String>,
}

impl WorkSubmission {
    fn parse(payload: &Value) -> Result<Self, JobError> {
        let submission: Self = parse_payload(payload, JobKind::SubmitWork)?;
        if submission.title.trim().is_empty() {
            return Err(JobError::validation("work submission needs a title"));
        }
        Ok(submission)
    }
}

impl CertificateMint {
    fn parse(payload: &Value) -> Result<Self, JobError> {
        let mint: Self = parse_payload(payload, JobKind::MintCertificate)?;
        if mint.recipient.trim().is_empty() {
            return Err(JobError::validation("certificate mint needs a recipient"));
        }
        Ok(mint)
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(payload: &Value, kind: JobKind) -> Result<T, JobError> {
    serde_json::from_value(payload.clone()).map_err(|e| JobError::validation(format!("invalid {kind} payload: {e}")))
}

fn idempotency_key(job: JobId, part: &str) -> String {
    format!("{job}/{part}")
}

/// Output of an earlier step, decoded.
fn prior_output<T: for<'de> Deserialize<'de>>(input: &StepInput, step: &str) -> Result<T, JobError> {
    let value = input
        .state
        .output(step)
        .ok_or_else(|| JobError::validation(format!("checkpoint has no output for '{step}'")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| JobError::validation(format!("unreadable output of '{step}': {e}")))
}

/// External services behind the built-in workflows.
#[derive(Clone)]
pub struct Collaborators {
    pub media: Arc<dyn MediaCache>,
    pub blobs: Arc<dyn BlobStore>,
    pub signer: Arc<dyn Signer>,
    pub ledger: Arc<dyn Ledger>,
    /// Delay between `get_status` polls while a transaction is pending
    pub confirmation_poll: Duration,
}

pub fn submit_work(collaborators: &Collaborators) -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowDefinition::new(
        JobKind::SubmitWork,
        vec![
            Arc::new(UploadMedia {
                media: collaborators.media.clone(),
                blobs: collaborators.blobs.clone(),
            }),
            Arc::new(SubmitAttestation {
                ledger: collaborators.ledger.clone(),
            }),
        ],
    )
}

pub fn mint_certificate(collaborators: &Collaborators) -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowDefinition::new(
        JobKind::MintCertificate,
        vec![
            Arc::new(UploadMetadata {
                blobs: collaborators.blobs.clone(),
            }),
            Arc::new(UploadAllowlist {
                blobs: collaborators.blobs.clone(),
            }),
            Arc::new(SubmitTransaction {
                signer: collaborators.signer.clone(),
            }),
            Arc::new(AwaitConfirmation {
                signer: collaborators.signer.clone(),
                poll: collaborators.confirmation_poll,
            }),
        ],
    )
}

/// Registry with a definition for every `JobKind`.
pub fn builtin_registry(collaborators: &Collaborators) -> Result<WorkflowRegistry, DefinitionError> {
    Ok(WorkflowRegistry::new()
        .with(submit_work(collaborators)?)
        .with(mint_certificate(collaborators)?))
}

/// Upload the bytes `bytes` resolves to under `key`, unless the blob store
/// already has that key. `bytes` is not polled in that case.
async fn upload_once(
    blobs: &dyn BlobStore,
    key: String,
    content_type: &str,
    name: Option<String>,
    bytes: impl Future<Output = Result<Vec<u8>, JobError>> + Send,
) -> Result<ContentAddress, JobError> {
    if let Some(address) = blobs.lookup(&key).await? {
        debug!(key = %key, address = %address, "blob already uploaded");
        return Ok(address);
    }
    let metadata = BlobMetadata {
        key,
        content_type: content_type.to_string(),
        name,
    };
    Ok(blobs.upload(bytes.await?, &metadata).await?)
}

fn json_bytes(value: &impl Serialize) -> std::future::Ready<Result<Vec<u8>, JobError>> {
    std::future::ready(serde_json::to_vec(value).map_err(|e| JobError::validation(e.to_string())))
}

struct UploadMedia {
    media: Arc<dyn MediaCache>,
    blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl Step for UploadMedia {
    fn name(&self) -> &str {
        UPLOAD_MEDIA
    }

    async fn run(&self, input: StepInput) -> Result<Value, JobError> {
        let submission = WorkSubmission::parse(&input.payload)?;

        let mut addresses = Vec::with_capacity(submission.media.len());
        for (i, reference) in submission.media.iter().enumerate() {
            let address = upload_once(
                self.blobs.as_ref(),
                idempotency_key(input.job_id, &format!("media/{i}")),
                "application/octet-stream",
                Some(reference.clone()),
                async { self.media.read(reference).await.map_err(JobError::from) },
            )
            .await?;
            addresses.push(address);
        }

        debug!(job_id = %input.job_id, count = addresses.len(), "media uploaded");
        Ok(json!(addresses))
    }
}

struct SubmitAttestation {
    ledger: Arc<dyn Ledger>,
}

#[async_trait]
impl Step for SubmitAttestation {
    fn name(&self) -> &str {
        SUBMIT_ATTESTATION
    }

    async fn run(&self, input: StepInput) -> Result<Value, JobError> {
        let submission = WorkSubmission::parse(&input.payload)?;
        let media: Vec<ContentAddress> = prior_output(&input, UPLOAD_MEDIA)?;
        let key = idempotency_key(input.job_id, "attestation");

        if let Some(reference) = self.ledger.find_attestation(&key).await? {
            return Ok(json!(reference));
        }
        let request = AttestationRequest {
            idempotency_key: key,
            schema: WORK_SCHEMA.to_string(),
            data: json!({
                "title": submission.title,
                "description": submission.description,
                "media": media,
            }),
        };
        Ok(json!(self.ledger.attest(&request).await?))
    }
}

struct UploadMetadata {
    blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl Step for UploadMetadata {
    fn name(&self) -> &str {
        UPLOAD_METADATA
    }

    async fn run(&self, input: StepInput) -> Result<Value, JobError> {
        let mint = CertificateMint::parse(&input.payload)?;
        let document = json!({
            "name": mint.name,
            "recipient": mint.recipient,
            "attributes": mint.metadata,
        });
        let address = upload_once(
            self.blobs.as_ref(),
            idempotency_key(input.job_id, "metadata"),
            "application/json",
            Some(format!("{}.json", mint.name)),
            json_bytes(&document),
        )
        .await?;
        Ok(json!(address))
    }
}

struct UploadAllowlist {
    blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl Step for UploadAllowlist {
    fn name(&self) -> &str {
        UPLOAD_ALLOWLIST
    }

    async fn run(&self, input: StepInput) -> Result<Value, JobError> {
        let mint = CertificateMint::parse(&input.payload)?;
        let address = upload_once(
            self.blobs.as_ref(),
            idempotency_key(input.job_id, "allowlist"),
            "application/json",
            None,
            json_bytes(&mint.allowlist),
        )
        .await?;
        Ok(json!(address))
    }
}

struct SubmitTransaction {
    signer: Arc<dyn Signer>,
}

/// A fresh key per rewind: a reverted transaction is never reused.
fn submission_key(input: &StepInput) -> String {
    match input.state.rewinds {
        0 => idempotency_key(input.job_id, "mint"),
        n => idempotency_key(input.job_id, &format!("mint/{n}")),
    }
}

#[async_trait]
impl Step for SubmitTransaction {
    fn name(&self) -> &str {
        SUBMIT_TRANSACTION
    }

    async fn run(&self, input: StepInput) -> Result<Value, JobError> {
        let mint = CertificateMint::parse(&input.payload)?;
        let metadata: ContentAddress = prior_output(&input, UPLOAD_METADATA)?;
        let allowlist: ContentAddress = prior_output(&input, UPLOAD_ALLOWLIST)?;
        let key = submission_key(&input);

        if let Some(pending) = self.signer.find_submitted(&key).await? {
            debug!(job_id = %input.job_id, reference = %pending.0, "reusing relayed transaction");
            return Ok(json!(pending));
        }
        let intent = TransactionIntent {
            idempotency_key: key,
            action: "mint".to_string(),
            arguments: json!({
                "recipient": mint.recipient,
                "metadata": metadata,
                "allowlist": allowlist,
            }),
        };
        Ok(json!(self.signer.build_and_submit(&intent).await?))
    }
}

/// Polls until the relay reports a final status. Bounded by the engine's
/// step timeout; a timeout leaves the submitted transaction in place for
/// the retry to pick up. A failed transaction rewinds to
/// `submit-transaction`, so a manual retry submits a new one.
struct AwaitConfirmation {
    signer: Arc<dyn Signer>,
    poll: Duration,
}

#[async_trait]
impl Step for AwaitConfirmation {
    fn name(&self) -> &str {
        AWAIT_CONFIRMATION
    }

    fn rewind_to(&self) -> Option<&str> {
        Some(SUBMIT_TRANSACTION)
    }

    async fn run(&self, input: StepInput) -> Result<Value, JobError> {
        let pending: PendingReference = prior_output(&input, SUBMIT_TRANSACTION)?;
        loop {
            match self.signer.get_status(&pending).await? {
                TransactionStatus::Confirmed { tx_hash } => {
                    return Ok(json!({ "txHash": tx_hash, "reference": pending }));
                }
                TransactionStatus::Failed { reason } => {
                    return Err(JobError::validation(format!("transaction {} failed: {reason}", pending.0)));
                }
                TransactionStatus::Pending => tokio::time::sleep(self.poll).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::jobs::{InMemoryJobStore, JobQueue, JobStatus, QueueConfig, RetryPolicy};
    use crate::workflow::collaborators::CollaboratorError;
    use crate::workflow::engine::{AlwaysOpen, EngineConfig, RunOutcome, WorkflowEngine};
    use crate::workflow::testing::{FakeBlobStore, FakeCollaborators};
    use verdant_core::ErrorCategory;

    struct Harness {
        fakes: FakeCollaborators,
        queue: Arc<JobQueue<InMemoryJobStore>>,
        engine: WorkflowEngine<InMemoryJobStore>,
    }

    fn harness(fakes: FakeCollaborators) -> Harness {
        let queue = Arc::new(JobQueue::new(
            InMemoryJobStore::new(),
            QueueConfig::default().with_retry_policy(RetryPolicy::exponential(
                3,
                Duration::from_millis(1),
                Duration::from_millis(2),
            )),
        ));
        let registry = builtin_registry(&fakes.collaborators()).unwrap();
        let engine = WorkflowEngine::new(
            queue.clone(),
            registry,
            EngineConfig::default().with_step_timeout(Duration::from_millis(200)),
        );
        Harness { fakes, queue, engine }
    }

    impl Harness {
        async fn run_next(&self) -> RunOutcome {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let job = self.queue.claim_next(None).await.unwrap().expect("eligible job");
            self.engine.run(job, &AlwaysOpen).await.unwrap()
        }
    }

    fn work(media: &[&str]) -> Value {
        json!({ "title": "Planted 3 trees", "media": media })
    }

    fn mint() -> Value {
        json!({
            "name": "Steward 2024",
            "recipient": "0xabc",
            "metadata": { "hours": 12 },
            "allowlist": ["0xabc", "0xdef"],
        })
    }

    #[test]
    fn registry_covers_every_kind() {
        let registry = builtin_registry(&FakeCollaborators::new().collaborators()).unwrap();
        for kind in JobKind::ALL {
            assert!(registry.get(kind).is_some(), "missing {kind}");
        }
        assert_eq!(
            registry.get(JobKind::MintCertificate).unwrap().step_names(),
            vec![UPLOAD_METADATA, UPLOAD_ALLOWLIST, SUBMIT_TRANSACTION, AWAIT_CONFIRMATION]
        );
    }

    #[tokio::test]
    async fn submit_work_uploads_media_then_attests() {
        let h = harness(FakeCollaborators::new());
        h.fakes.media.insert("local://a.jpg", b"a".to_vec());
        h.fakes.media.insert("local://b.jpg", b"b".to_vec());
        let job = h
            .queue
            .enqueue(JobKind::SubmitWork, work(&["local://a.jpg", "local://b.jpg"]))
            .await
            .unwrap();

        let outcome = h.run_next().await;
        let key = idempotency_key(job.id, "attestation");
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                result: Some(json!(format!("att:{key}")))
            }
        );

        let request = h.fakes.ledger.attestation(&key).unwrap();
        assert_eq!(request.data["media"].as_array().unwrap().len(), 2);
        assert_eq!(h.fakes.blobs.upload_count(), 2);
    }

    #[tokio::test]
    async fn media_already_uploaded_is_not_uploaded_again() {
        let h = harness(FakeCollaborators::new());
        h.fakes.media.insert("local://a.jpg", b"a".to_vec());
        h.fakes.media.insert("local://b.jpg", b"b".to_vec());
        let job = h
            .queue
            .enqueue(JobKind::SubmitWork, work(&["local://a.jpg", "local://b.jpg"]))
            .await
            .unwrap();

        // The first item landed before an earlier attempt died uncheckpointed.
        h.fakes
            .blobs
            .upload(
                b"a".to_vec(),
                &BlobMetadata {
                    key: idempotency_key(job.id, "media/0"),
                    content_type: "application/octet-stream".into(),
                    name: None,
                },
            )
            .await
            .unwrap();

        let outcome = h.run_next().await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(h.fakes.media.reads.load(Ordering::SeqCst), 1);
        assert_eq!(h.fakes.blobs.upload_count(), 2);
    }

    #[tokio::test]
    async fn missing_title_is_terminal_validation() {
        let h = harness(FakeCollaborators::new());
        let job = h
            .queue
            .enqueue(JobKind::SubmitWork, json!({ "title": "  ", "media": [] }))
            .await
            .unwrap();

        assert!(matches!(h.run_next().await, RunOutcome::Failed { will_retry: false, .. }));
        let stored = h.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::FailedTerminal);
        assert_eq!(stored.last_error.unwrap().category, ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn oversized_media_is_terminal() {
        let fakes = FakeCollaborators {
            blobs: Arc::new(FakeBlobStore::with_size_limit(4)),
            ..FakeCollaborators::new()
        };
        let h = harness(fakes);
        h.fakes.media.insert("local://big.mov", vec![0u8; 64]);
        h.queue
            .enqueue(JobKind::SubmitWork, work(&["local://big.mov"]))
            .await
            .unwrap();

        match h.run_next().await {
            RunOutcome::Failed { error, will_retry } => {
                assert_eq!(error.category, ErrorCategory::Validation);
                assert!(!will_retry);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn mint_runs_to_confirmation() {
        let h = harness(FakeCollaborators::new());
        h.fakes.signer.script_status(TransactionStatus::Pending);
        h.fakes.signer.script_status(TransactionStatus::Pending);
        let job = h.queue.enqueue(JobKind::MintCertificate, mint()).await.unwrap();

        let outcome = h.run_next().await;
        let RunOutcome::Completed { result: Some(result) } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(result["txHash"], json!("0xuserop-1"));

        let intent = h.fakes.signer.submission(&idempotency_key(job.id, "mint")).unwrap();
        assert_eq!(intent.arguments["recipient"], json!("0xabc"));
        assert_eq!(h.fakes.blobs.upload_count(), 2);
        assert_eq!(h.fakes.signer.status_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn relay_failure_retries_without_resubmitting_uploads() {
        let h = harness(FakeCollaborators::new());
        h.fakes.signer.failures.push(CollaboratorError::Service("relay 502".into()));
        let job = h.queue.enqueue(JobKind::MintCertificate, mint()).await.unwrap();

        assert!(matches!(h.run_next().await, RunOutcome::Failed { will_retry: true, .. }));
        let stored = h.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.workflow_state.last_completed_step.as_deref(), Some(UPLOAD_ALLOWLIST));

        assert!(matches!(h.run_next().await, RunOutcome::Completed { .. }));
        assert_eq!(h.fakes.blobs.upload_count(), 2);
        assert_eq!(h.fakes.signer.submit_count(), 2);
    }

    #[tokio::test]
    async fn user_rejection_is_terminal() {
        let h = harness(FakeCollaborators::new());
        h.fakes.signer.failures.push(CollaboratorError::UserRejected("dismissed".into()));
        h.queue.enqueue(JobKind::MintCertificate, mint()).await.unwrap();

        match h.run_next().await {
            RunOutcome::Failed { error, will_retry } => {
                assert_eq!(error.category, ErrorCategory::UserRejected);
                assert!(!will_retry);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_transaction_is_terminal() {
        let h = harness(FakeCollaborators::new());
        h.fakes.signer.script_status(TransactionStatus::Failed {
            reason: "reverted".into(),
        });
        let job = h.queue.enqueue(JobKind::MintCertificate, mint()).await.unwrap();

        assert!(matches!(h.run_next().await, RunOutcome::Failed { will_retry: false, .. }));
        let stored = h.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::FailedTerminal);
        assert_eq!(stored.workflow_state.last_completed_step.as_deref(), Some(UPLOAD_ALLOWLIST));
        assert!(stored.workflow_state.output(SUBMIT_TRANSACTION).is_none());
    }

    #[tokio::test]
    async fn retry_after_a_reverted_transaction_submits_a_new_one() {
        let h = harness(FakeCollaborators::new());
        h.fakes.signer.script_status(TransactionStatus::Failed {
            reason: "reverted".into(),
        });
        let job = h.queue.enqueue(JobKind::MintCertificate, mint()).await.unwrap();
        assert!(matches!(h.run_next().await, RunOutcome::Failed { will_retry: false, .. }));

        h.queue.retry(job.id).await.unwrap();
        let outcome = h.run_next().await;
        let RunOutcome::Completed { result: Some(result) } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(result["txHash"], json!("0xuserop-2"));

        assert_eq!(h.fakes.signer.submit_count(), 2);
        assert!(h.fakes.signer.submission(&idempotency_key(job.id, "mint/1")).is_some());
        assert_eq!(h.fakes.blobs.upload_count(), 2);
    }
}
