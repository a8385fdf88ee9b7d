//! Integration framework for the flowcore workflow execution runtime.
//!
//! This crate provides:
//!
//! - **Credential vault**: Encrypted storage for integration credentials
//! - **Rate limiter**: Per-integration rate limiting
//! - **Masking**: Secret redaction shared by the sandbox and the logging layer

pub mod credential;
pub mod error;
pub mod masking;
pub mod rate_limit;

pub use credential::{Credential, CredentialData, CredentialType, CredentialVault};
pub use error::{CredentialError, IntegrationError};
pub use masking::{MASK_PLACEHOLDER, is_sensitive_key, mask_sensitive};
pub use rate_limit::{RateLimitConfig, RateLimiter};
