//! `verdant-core`: identifiers, job kinds and the failure taxonomy.
//!
//! This crate has no infrastructure concerns; every other crate in the
//! workspace depends on it.

pub mod error;
pub mod id;
pub mod kind;

pub use error::{ErrorCategory, InvalidId, JobError};
pub use id::JobId;
pub use kind::JobKind;
