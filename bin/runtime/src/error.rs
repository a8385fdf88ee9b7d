//! Top-level error type for the runtime binary.
//!
//! Wraps the narrower errors each collaborator returns (config, NATS
//! connection, admission) into one type `main` can log and exit on.

use flowcore_concurrency::RejectReason;
use flowcore_engine::{ExecutionError, HistoryError};
use std::fmt;

#[derive(Debug)]
pub enum RuntimeError {
    Config(config::ConfigError),
    Nats(async_nats::ConnectError),
    History(HistoryError),
    Execution(ExecutionError),
    Rejected(RejectReason),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Nats(e) => write!(f, "nats connection error: {e}"),
            Self::History(e) => write!(f, "history sink error: {e}"),
            Self::Execution(e) => write!(f, "execution error: {e}"),
            Self::Rejected(reason) => write!(f, "admission rejected: {reason}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<config::ConfigError> for RuntimeError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<async_nats::ConnectError> for RuntimeError {
    fn from(e: async_nats::ConnectError) -> Self {
        Self::Nats(e)
    }
}

impl From<HistoryError> for RuntimeError {
    fn from(e: HistoryError) -> Self {
        Self::History(e)
    }
}

impl From<ExecutionError> for RuntimeError {
    fn from(e: ExecutionError) -> Self {
        Self::Execution(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_display_names_reason() {
        let err = RuntimeError::Rejected(RejectReason::GlobalCapacity);
        assert!(err.to_string().contains("global"));
    }
}
