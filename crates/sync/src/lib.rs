//! `verdant-sync`
//!
//! **Responsibility:** moving queued work forward when the network allows.
//!
//! This crate provides:
//! - A connectivity signal that also gates workflow steps
//! - The network-aware scheduler and its control handle
//! - Configuration, including `VERDANT_*` environment overrides
//! - Runtime wiring over the SQLite store

pub mod config;
pub mod offline;
pub mod runtime;
pub mod scheduler;

pub use config::{SchedulerConfig, SyncConfig};
pub use offline::{Connectivity, ConnectivityState};
pub use runtime::SyncRuntime;
pub use scheduler::{DrainReport, Scheduler, SchedulerError, SchedulerHandle};
