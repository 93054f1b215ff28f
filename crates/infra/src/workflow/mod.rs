//! Resumable multi-step workflows.
//!
//! A [`WorkflowDefinition`] lists the named steps for one job kind; the
//! [`WorkflowEngine`] runs a claimed job through them, checkpointing after
//! each step so any crash or failure resumes at the first unfinished one.

pub mod builtin;
pub mod collaborators;
pub mod definition;
pub mod engine;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use builtin::{CertificateMint, Collaborators, WorkSubmission, builtin_registry};
pub use collaborators::{
    AttestationRequest, BlobMetadata, BlobStore, CollaboratorError, ContentAddress, Ledger, MediaCache,
    PendingReference, Signer, TransactionIntent, TransactionStatus,
};
pub use definition::{DefinitionError, FnStep, Step, StepInput, WorkflowDefinition, WorkflowRegistry};
pub use engine::{AlwaysOpen, EngineConfig, RunOutcome, StepGate, WorkflowEngine};
