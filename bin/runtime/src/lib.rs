//! The flowcore runtime: wires the Flow Execution Engine, the Trigger
//! Concurrency Manager, the Event Fan-out, and a NATS-backed History
//! Sink together behind the trigger-ingress and event-subscription
//! interfaces spec §6 names.

pub mod app;
pub mod config;
pub mod error;
pub mod queue;

pub use app::{Runtime, TriggerRequest, TriggerResponse, TriggerStatus};
pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use queue::TriggerEnvelope;
