//! The node-type catalog: the external collaborator that knows what a
//! node type actually does.
//!
//! The engine schedules nodes and moves data between them without ever
//! branching on `node_type`. Each node type's shape (its ports, its
//! default parameters, the credential slots it needs) and behavior (its
//! `execute` operation) live behind this trait, so the catalog can be
//! swapped or extended without touching the scheduling loop.

use crate::port::{InputPort, OutputPort};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Static description of a node type: its ports, defaults, and the
/// credential types it requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTypeDescriptor {
    /// The catalog key, e.g. `"http.request"`.
    #[serde(rename = "type")]
    pub type_name: String,
    pub display_name: String,
    pub group: String,
    pub version: u32,
    #[serde(default)]
    pub properties: JsonValue,
    pub inputs: Vec<InputPort>,
    pub outputs: Vec<OutputPort>,
    #[serde(default)]
    pub defaults: JsonValue,
    #[serde(default)]
    pub required_credentials: Vec<String>,
    /// Whether this node type can select among multiple output channels
    /// at runtime (branching), rather than always emitting to `main`.
    #[serde(default)]
    pub branching: bool,
    /// Whether a node of this type failing should still satisfy its
    /// dependents (with an empty input bundle) rather than cascade a
    /// skip to everything downstream. Mirrors a node-level `continueOnFail`
    /// override; the default (`false`) is "stop successors".
    #[serde(default)]
    pub continue_on_fail: bool,
}

impl NodeTypeDescriptor {
    #[must_use]
    pub fn new(type_name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            display_name: display_name.into(),
            group: "general".to_string(),
            version: 1,
            properties: JsonValue::Object(serde_json::Map::new()),
            inputs: Vec::new(),
            outputs: Vec::new(),
            defaults: JsonValue::Object(serde_json::Map::new()),
            required_credentials: Vec::new(),
            branching: false,
            continue_on_fail: false,
        }
    }

    #[must_use]
    pub fn with_inputs(mut self, inputs: Vec<InputPort>) -> Self {
        self.inputs = inputs;
        self
    }

    #[must_use]
    pub fn with_outputs(mut self, outputs: Vec<OutputPort>) -> Self {
        self.outputs = outputs;
        self
    }

    #[must_use]
    pub fn with_branching(mut self, branching: bool) -> Self {
        self.branching = branching;
        self
    }

    #[must_use]
    pub fn with_required_credentials(mut self, credentials: Vec<String>) -> Self {
        self.required_credentials = credentials;
        self
    }

    #[must_use]
    pub fn with_continue_on_fail(mut self, continue_on_fail: bool) -> Self {
        self.continue_on_fail = continue_on_fail;
        self
    }
}

/// Error returned when a node's declared type isn't known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNodeType {
    pub type_name: String,
}

impl std::fmt::Display for UnknownNodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown node type: {}", self.type_name)
    }
}

impl std::error::Error for UnknownNodeType {}

/// The catalog: lists and resolves node type descriptors.
///
/// Execution behavior is looked up separately, through
/// [`crate::sandbox::NodeExecutor`] keyed by `node_type`; this trait only
/// answers "what does this type look like".
#[async_trait]
pub trait NodeTypeCatalog: Send + Sync {
    /// Lists every node type the catalog knows about.
    async fn list(&self) -> Vec<NodeTypeDescriptor>;

    /// Looks up a single node type by its catalog key.
    async fn get(&self, type_name: &str) -> Result<NodeTypeDescriptor, UnknownNodeType>;
}

/// An in-memory catalog, used by tests and as a starting point for a
/// statically configured deployment.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNodeTypeCatalog {
    types: Arc<HashMap<String, NodeTypeDescriptor>>,
}

impl InMemoryNodeTypeCatalog {
    #[must_use]
    pub fn new(descriptors: Vec<NodeTypeDescriptor>) -> Self {
        let types = descriptors
            .into_iter()
            .map(|d| (d.type_name.clone(), d))
            .collect();
        Self {
            types: Arc::new(types),
        }
    }
}

#[async_trait]
impl NodeTypeCatalog for InMemoryNodeTypeCatalog {
    async fn list(&self) -> Vec<NodeTypeDescriptor> {
        self.types.values().cloned().collect()
    }

    async fn get(&self, type_name: &str) -> Result<NodeTypeDescriptor, UnknownNodeType> {
        self.types.get(type_name).cloned().ok_or_else(|| UnknownNodeType {
            type_name: type_name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortSchema;

    fn http_request_type() -> NodeTypeDescriptor {
        NodeTypeDescriptor::new("http.request", "HTTP Request")
            .with_inputs(vec![InputPort::required("main", PortSchema::object())])
            .with_outputs(vec![OutputPort::new("main", PortSchema::object())])
    }

    #[tokio::test]
    async fn lists_registered_types() {
        let catalog = InMemoryNodeTypeCatalog::new(vec![http_request_type()]);
        let types = catalog.list().await;
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].type_name, "http.request");
    }

    #[tokio::test]
    async fn get_returns_unknown_for_missing_type() {
        let catalog = InMemoryNodeTypeCatalog::new(vec![]);
        let result = catalog.get("nope").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn get_returns_descriptor_for_known_type() {
        let catalog = InMemoryNodeTypeCatalog::new(vec![http_request_type()]);
        let descriptor = catalog.get("http.request").await.expect("found");
        assert_eq!(descriptor.display_name, "HTTP Request");
    }
}
