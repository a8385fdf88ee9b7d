//! The node: one step in a workflow.
//!
//! A node names a type it wants from the node-type catalog (`node_type`),
//! carries the parameters the catalog's executor will resolve against the
//! run's variables, and optionally names which credential to inject for
//! each credential slot the type declares. The catalog, not this struct,
//! knows what a node type actually does.

use flowcore_core::CredentialId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use ulid::Ulid;

/// Unique identifier for a node within a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Ulid);

impl NodeId {
    /// Generates a new, time-sortable node id.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// A single step in a workflow snapshot.
///
/// `node_type` is a key into the node-type catalog; it is opaque to the
/// engine, which never branches on it directly. `mock_data`, when present,
/// is substituted for the real output during a test run instead of invoking
/// the catalog's executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub parameters: JsonValue,
    #[serde(default)]
    pub credentials: HashMap<String, CredentialId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_data: Option<JsonValue>,
}

impl Node {
    /// Creates a new node with a fresh id.
    #[must_use]
    pub fn new(node_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            node_type: node_type.into(),
            name: name.into(),
            parameters: JsonValue::Object(serde_json::Map::new()),
            credentials: HashMap::new(),
            mock_data: None,
        }
    }

    /// Creates a node with an explicit id, for reconstructing a snapshot.
    #[must_use]
    pub fn with_id(id: NodeId, node_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            ..Self::new(node_type, name)
        }
    }

    /// Attaches parameters, replacing whatever was set before.
    #[must_use]
    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    /// Binds a credential slot name to a stored credential.
    #[must_use]
    pub fn with_credential(mut self, slot: impl Into<String>, credential: CredentialId) -> Self {
        self.credentials.insert(slot.into(), credential);
        self
    }

    /// Attaches mock output data, for test runs that should bypass the
    /// real node-type executor.
    #[must_use]
    pub fn with_mock_data(mut self, mock_data: JsonValue) -> Self {
        self.mock_data = Some(mock_data);
        self
    }

    /// Returns true if this node should use mock data instead of invoking
    /// its catalog executor.
    #[must_use]
    pub fn has_mock_data(&self) -> bool {
        self.mock_data.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display_has_prefix() {
        let id = NodeId::new();
        assert!(id.to_string().starts_with("node_"));
    }

    #[test]
    fn node_new_has_empty_parameters_and_no_mock() {
        let node = Node::new("http.request", "Fetch data");
        assert_eq!(node.node_type, "http.request");
        assert_eq!(node.name, "Fetch data");
        assert!(node.parameters.is_object());
        assert!(!node.has_mock_data());
    }

    #[test]
    fn node_with_credential_binds_slot() {
        let cred = CredentialId::new();
        let node = Node::new("slack.post", "Notify").with_credential("slack", cred);
        assert_eq!(node.credentials.get("slack"), Some(&cred));
    }

    #[test]
    fn node_with_mock_data_marks_node() {
        let node = Node::new("noop", "Test").with_mock_data(serde_json::json!({"ok": true}));
        assert!(node.has_mock_data());
    }

    #[test]
    fn node_serde_roundtrip() {
        let node = Node::new("transform.map", "Reshape")
            .with_parameters(serde_json::json!({"expression": "$json.value"}));
        let json = serde_json::to_string(&node).expect("serialize");
        let parsed: Node = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.node_type, "transform.map");
        assert_eq!(parsed.id, node.id);
    }
}
