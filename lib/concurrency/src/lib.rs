//! The Trigger Concurrency Manager (spec §4.4).
//!
//! Admits, queues, prioritizes, and isolates concurrent workflow
//! executions, and holds the per-node resource lock table isolated runs
//! serialize against. The cron scheduler and trigger-storage layer that
//! feed admission requests into this crate are external collaborators
//! (spec §1) and out of scope here; this crate starts at the admission
//! decision itself.

pub mod error;
pub mod manager;

pub use error::{ConcurrencyError, RejectReason};
pub use manager::{
    AdmissionDecision, AdmissionId, AdmissionRequest, AdmissionStrategy, ConcurrencyManager, Limits, LockSet,
    PromotionOutcome, QueuedTicket,
};
