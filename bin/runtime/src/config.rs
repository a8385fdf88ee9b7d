//! Centralized runtime configuration.
//!
//! Loaded via the `config` crate from environment variables, following
//! the same flat, separator-free layout §6 documents: `CONCURRENCY`,
//! `PER_WORKFLOW`, `SANDBOX_MEMORY_MB`, and so on. Every key is optional
//! and defaults to the value §6 gives it.

use flowcore_concurrency::Limits;
use flowcore_engine::{ExecutionOptions, FanoutConfig, ResourceCaps, RetryPolicy};
use serde::Deserialize;
use std::time::Duration;

/// Runtime configuration composed from the execution core's collaborators.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// NATS server URL for the history sink and event relay.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_per_workflow")]
    pub per_workflow: usize,
    #[serde(default = "default_per_user")]
    pub per_user: usize,
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,

    #[serde(default = "default_sandbox_memory_mb")]
    pub sandbox_memory_mb: u64,
    #[serde(default = "default_sandbox_output_mb")]
    pub sandbox_output_mb: u64,
    #[serde(default = "default_sandbox_http_timeout_ms")]
    pub sandbox_http_timeout_ms: u64,
    #[serde(default = "default_sandbox_max_concurrent_reqs")]
    pub sandbox_max_concurrent_reqs: u32,

    #[serde(default = "default_event_replay_window_ms")]
    pub event_replay_window_ms: i64,
    #[serde(default = "default_event_replay_max")]
    pub event_replay_max: usize,

    #[serde(default)]
    pub allow_private_networks: bool,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}
fn default_concurrency() -> usize {
    10
}
fn default_per_workflow() -> usize {
    3
}
fn default_per_user() -> usize {
    5
}
fn default_max_queue_len() -> usize {
    100
}
fn default_queue_timeout_secs() -> u64 {
    300
}
fn default_timeout_ms() -> u64 {
    300_000
}
fn default_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_retry_cap_ms() -> u64 {
    10_000
}
fn default_sandbox_memory_mb() -> u64 {
    128
}
fn default_sandbox_output_mb() -> u64 {
    10
}
fn default_sandbox_http_timeout_ms() -> u64 {
    30_000
}
fn default_sandbox_max_concurrent_reqs() -> u32 {
    5
}
fn default_event_replay_window_ms() -> i64 {
    10_000
}
fn default_event_replay_max() -> usize {
    50
}

impl RuntimeConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a present key can't be parsed into its target
    /// type.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    #[must_use]
    pub fn concurrency_limits(&self) -> Limits {
        Limits {
            global: self.concurrency,
            per_workflow: self.per_workflow,
            per_user: self.per_user,
            max_queue_len: self.max_queue_len,
            queue_timeout: Duration::from_secs(self.queue_timeout_secs),
        }
    }

    #[must_use]
    pub fn fanout_config(&self) -> FanoutConfig {
        FanoutConfig {
            replay_window: chrono::Duration::milliseconds(self.event_replay_window_ms),
            replay_max: self.event_replay_max,
            channel_capacity: 256,
        }
    }

    #[must_use]
    pub fn resource_caps(&self) -> ResourceCaps {
        ResourceCaps {
            wall_clock: Duration::from_millis(self.default_timeout_ms),
            memory_bytes: self.sandbox_memory_mb * 1024 * 1024,
            output_bytes: self.sandbox_output_mb * 1024 * 1024,
            max_concurrent_requests: self.sandbox_max_concurrent_reqs,
            request_timeout: Duration::from_millis(self.sandbox_http_timeout_ms),
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retries,
            initial_delay_ms: self.retry_base_ms,
            backoff_multiplier: 2.0,
            max_delay_ms: self.retry_cap_ms,
        }
    }

    #[must_use]
    pub fn default_execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            timeout_ms: Some(self.default_timeout_ms),
            retry: Some(self.retry_policy()),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            concurrency: default_concurrency(),
            per_workflow: default_per_workflow(),
            per_user: default_per_user(),
            max_queue_len: default_max_queue_len(),
            queue_timeout_secs: default_queue_timeout_secs(),
            default_timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            sandbox_memory_mb: default_sandbox_memory_mb(),
            sandbox_output_mb: default_sandbox_output_mb(),
            sandbox_http_timeout_ms: default_sandbox_http_timeout_ms(),
            sandbox_max_concurrent_reqs: default_sandbox_max_concurrent_reqs(),
            event_replay_window_ms: default_event_replay_window_ms(),
            event_replay_max: default_event_replay_max(),
            allow_private_networks: false,
        }
    }
}
