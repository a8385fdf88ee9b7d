//! Composition root for the flowcore runtime.
//!
//! Loads configuration, connects to NATS for the durable history sink,
//! the event relay, and the trigger work queue, wires the Flow Execution
//! Engine and Trigger Concurrency Manager together, spawns the work-queue
//! consumer, and idles until signalled to shut down. The HTTP/webhook
//! ingress, the cron scheduler, and the node-type catalog's real node
//! implementations live outside this binary (spec §1) — they hand a
//! fired trigger to the runtime by publishing a [`queue::TriggerEnvelope`]
//! onto the work queue rather than calling anything here directly.

use flowcore_engine::nats::{NatsConfig, NatsEventRelay, NatsHistorySink};
use flowcore_engine::{Engine, Fanout, InMemoryNodeTypeCatalog};
use flowcore_integration::credential::InMemoryCredentialVault;
use flowcore_runtime::{queue, Runtime, RuntimeConfig, RuntimeError};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), RuntimeError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RuntimeConfig::from_env()?;
    tracing::info!("loaded runtime configuration");

    tracing::info!(url = %config.nats_url, "connecting to nats for history sink");
    let history = Arc::new(NatsHistorySink::connect(NatsConfig::new(config.nats_url.clone())).await?);

    let client = async_nats::connect(&config.nats_url).await?;
    let relay = Arc::new(NatsEventRelay::new(client.clone(), "flowcore.events"));

    // Real node-type descriptors and their executors arrive from the
    // marketplace/uploader (spec §1); this is an empty starting catalog
    // plus the sandbox's mock-data bypass, wired in per deployment.
    let catalog = Arc::new(InMemoryNodeTypeCatalog::new(vec![]));
    let executor = Arc::new(NoopNodeExecutor);
    let vault = Arc::new(InMemoryCredentialVault::new());
    let fanout = Arc::new(Fanout::new(config.fanout_config()));

    let engine = Engine::new(catalog, executor, vault, fanout.clone(), history.clone());
    let concurrency = Arc::new(flowcore_concurrency::ConcurrencyManager::new(config.concurrency_limits()));

    let runtime = Arc::new(
        Runtime::new(engine, concurrency, fanout, history, config.default_execution_options()).with_relay(relay),
    );
    runtime.spawn_queue_eviction(Duration::from_secs(30));

    tokio::spawn(queue::run(async_nats::jetstream::new(client), runtime.clone()));

    tracing::info!("flowcore runtime ready");
    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    tracing::info!("shutting down");
    Ok(())
}

/// Placeholder [`flowcore_engine::NodeExecutor`] for node types the
/// catalog doesn't resolve to a real implementation. Real deployments
/// replace this with an executor backed by the marketplace's installed
/// node types; every node in a workflow snapshot can still run via
/// `Node::mock_data` without ever reaching this far.
struct NoopNodeExecutor;

#[async_trait::async_trait]
impl flowcore_engine::NodeExecutor for NoopNodeExecutor {
    async fn execute(
        &self,
        node_type: &str,
        _parameters: &serde_json::Value,
        _input_item: &serde_json::Value,
        _credentials: &flowcore_engine::ResolvedCredentials,
        _cancellation: &flowcore_engine::CancellationSignal,
    ) -> Result<serde_json::Value, flowcore_engine::SandboxError> {
        Err(flowcore_engine::SandboxError::validation(format!("no executor installed for node type '{node_type}'")))
    }
}
