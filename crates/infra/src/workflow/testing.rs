//! In-process collaborator fakes with call counters and scripted failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::builtin::Collaborators;
use super::collaborators::{
    AttestationRequest, BlobMetadata, BlobStore, CollaboratorError, ContentAddress, Ledger, MediaCache,
    PendingReference, Signer, TransactionIntent, TransactionStatus,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Queue of failures handed out one per call before calls start succeeding.
#[derive(Debug, Default)]
pub struct FailureScript {
    queued: Mutex<VecDeque<CollaboratorError>>,
}

impl FailureScript {
    pub fn push(&self, err: CollaboratorError) {
        lock(&self.queued).push_back(err);
    }

    fn next(&self) -> Result<(), CollaboratorError> {
        match lock(&self.queued).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeMediaCache {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub reads: AtomicUsize,
}

impl FakeMediaCache {
    pub fn insert(&self, reference: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        lock(&self.blobs).insert(reference.into(), bytes.into());
    }
}

#[async_trait]
impl MediaCache for FakeMediaCache {
    async fn read(&self, reference: &str) -> Result<Vec<u8>, CollaboratorError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        lock(&self.blobs)
            .get(reference)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("no cached media at {reference}")))
    }
}

/// Content-addressed store keyed by upload key.
#[derive(Debug, Default)]
pub struct FakeBlobStore {
    uploads: Mutex<HashMap<String, ContentAddress>>,
    pub failures: FailureScript,
    pub upload_calls: AtomicUsize,
    size_limit: Option<usize>,
}

impl FakeBlobStore {
    pub fn with_size_limit(limit: usize) -> Self {
        Self {
            size_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn uploaded(&self, key: &str) -> Option<ContentAddress> {
        lock(&self.uploads).get(key).cloned()
    }

    pub fn upload_count(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn upload(&self, bytes: Vec<u8>, metadata: &BlobMetadata) -> Result<ContentAddress, CollaboratorError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.next()?;
        if let Some(limit) = self.size_limit.filter(|limit| bytes.len() > *limit) {
            return Err(CollaboratorError::PayloadTooLarge {
                size: bytes.len(),
                limit,
            });
        }

        let mut uploads = lock(&self.uploads);
        let address = ContentAddress(format!("bafy{:04}", uploads.len() + 1));
        uploads.insert(metadata.key.clone(), address.clone());
        Ok(address)
    }

    async fn lookup(&self, key: &str) -> Result<Option<ContentAddress>, CollaboratorError> {
        Ok(self.uploaded(key))
    }
}

/// Relay that remembers submissions by idempotency key; statuses are
/// scripted and default to confirmed.
#[derive(Debug, Default)]
pub struct FakeSigner {
    submitted: Mutex<HashMap<String, (PendingReference, TransactionIntent)>>,
    statuses: Mutex<VecDeque<TransactionStatus>>,
    pub failures: FailureScript,
    pub submit_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
}

impl FakeSigner {
    pub fn script_status(&self, status: TransactionStatus) {
        lock(&self.statuses).push_back(status);
    }

    pub fn submission(&self, idempotency_key: &str) -> Option<TransactionIntent> {
        lock(&self.submitted).get(idempotency_key).map(|(_, intent)| intent.clone())
    }

    pub fn submit_count(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn build_and_submit(&self, intent: &TransactionIntent) -> Result<PendingReference, CollaboratorError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.next()?;

        let mut submitted = lock(&self.submitted);
        let reference = PendingReference(format!("userop-{}", submitted.len() + 1));
        submitted.insert(intent.idempotency_key.clone(), (reference.clone(), intent.clone()));
        Ok(reference)
    }

    async fn get_status(&self, reference: &PendingReference) -> Result<TransactionStatus, CollaboratorError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.statuses).pop_front().unwrap_or_else(|| TransactionStatus::Confirmed {
            tx_hash: format!("0x{}", reference.0),
        }))
    }

    async fn find_submitted(&self, idempotency_key: &str) -> Result<Option<PendingReference>, CollaboratorError> {
        Ok(lock(&self.submitted)
            .get(idempotency_key)
            .map(|(reference, _)| reference.clone()))
    }
}

#[derive(Debug, Default)]
pub struct FakeLedger {
    attestations: Mutex<HashMap<String, AttestationRequest>>,
    pub failures: FailureScript,
    pub attest_calls: AtomicUsize,
}

impl FakeLedger {
    pub fn attestation(&self, idempotency_key: &str) -> Option<AttestationRequest> {
        lock(&self.attestations).get(idempotency_key).cloned()
    }

    pub fn attest_count(&self) -> usize {
        self.attest_calls.load(Ordering::SeqCst)
    }
}

fn attestation_reference(key: &str) -> String {
    format!("att:{key}")
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn attest(&self, request: &AttestationRequest) -> Result<String, CollaboratorError> {
        self.attest_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.next()?;
        lock(&self.attestations).insert(request.idempotency_key.clone(), request.clone());
        Ok(attestation_reference(&request.idempotency_key))
    }

    async fn find_attestation(&self, idempotency_key: &str) -> Result<Option<String>, CollaboratorError> {
        Ok(lock(&self.attestations)
            .contains_key(idempotency_key)
            .then(|| attestation_reference(idempotency_key)))
    }
}

/// One of each fake, shared with the `Collaborators` they back.
#[derive(Debug, Clone, Default)]
pub struct FakeCollaborators {
    pub media: Arc<FakeMediaCache>,
    pub blobs: Arc<FakeBlobStore>,
    pub signer: Arc<FakeSigner>,
    pub ledger: Arc<FakeLedger>,
}

impl FakeCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            media: self.media.clone(),
            blobs: self.blobs.clone(),
            signer: self.signer.clone(),
            ledger: self.ledger.clone(),
            confirmation_poll: Duration::from_millis(5),
        }
    }
}
