//! Core domain types and utilities for the flowcore workflow execution runtime.
//!
//! This crate provides the foundational types, error handling, and shared
//! utilities used throughout the execution core: strongly-typed IDs, the
//! layered `Result` alias, and the versioned envelope wrapper persisted
//! alongside every durable record.

pub mod envelope;
pub mod error;
pub mod id;

pub use envelope::{CURRENT_VERSION, Envelope, RawEnvelope};
pub use error::Result;
pub use id::{
    CredentialId, IntegrationAccountId, NodeExecutionId, ParseIdError, TriggerId, UserId,
    WorkflowId, WorkflowRunId,
};
