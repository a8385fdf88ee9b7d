//! Error types for the integration crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `CredentialError`: Errors from credential storage/retrieval
//! - `IntegrationError`: High-level wrapper for context

use flowcore_core::{CredentialId, IntegrationAccountId};
use std::fmt;

/// Errors from credential operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Credential not found.
    NotFound { id: CredentialId },
    /// Encryption failed.
    EncryptionFailed { reason: String },
    /// Decryption failed.
    DecryptionFailed { reason: String },
    /// Invalid credential format.
    InvalidFormat { reason: String },
    /// Storage operation failed.
    StorageFailed { reason: String },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => {
                write!(f, "credential not found: {id}")
            }
            Self::EncryptionFailed { reason } => {
                write!(f, "encryption failed: {reason}")
            }
            Self::DecryptionFailed { reason } => {
                write!(f, "decryption failed: {reason}")
            }
            Self::InvalidFormat { reason } => {
                write!(f, "invalid credential format: {reason}")
            }
            Self::StorageFailed { reason } => {
                write!(f, "storage operation failed: {reason}")
            }
        }
    }
}

impl std::error::Error for CredentialError {}

/// High-level integration errors.
///
/// Use these to add context when wrapping lower-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    /// Integration account not found.
    AccountNotFound { id: IntegrationAccountId },
    /// Credential operation context (use as context wrapper).
    CredentialOperation { credential_id: CredentialId },
}

impl fmt::Display for IntegrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccountNotFound { id } => {
                write!(f, "integration account not found: {id}")
            }
            Self::CredentialOperation { credential_id } => {
                write!(f, "credential operation failed for {credential_id}")
            }
        }
    }
}

impl std::error::Error for IntegrationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_error_display() {
        let id = CredentialId::new();
        let err = CredentialError::NotFound { id };
        assert!(err.to_string().contains("credential not found"));
    }

    #[test]
    fn integration_error_display() {
        let id = CredentialId::new();
        let err = IntegrationError::CredentialOperation { credential_id: id };
        assert!(err.to_string().contains("credential operation failed"));
    }
}
