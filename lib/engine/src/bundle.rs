//! The bundle: data exchanged on edges.
//!
//! A bundle is a named map from channel name to a sequence of items, where
//! an item is an opaque JSON value tree. The default channel is [`MAIN`].
//! Edges carry items from the source's output channel to the target's
//! input channel, appending items at merge points in the snapshot's edge
//! order — never re-sorted, never deduplicated.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// The default channel name used when a node type declares no other
/// output or input channels.
pub const MAIN: &str = "main";

/// An opaque value tree carried as one unit of data through a bundle.
pub type Item = JsonValue;

/// A named collection of item sequences exchanged between nodes.
///
/// Channel order is insertion order is not significant for lookups (a
/// `BTreeMap` keeps serialization deterministic for snapshot round-trips),
/// but the items *within* a channel are strictly ordered: they are
/// appended in the snapshot's edge order and never reordered afterward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    channels: BTreeMap<String, Vec<Item>>,
}

impl Bundle {
    /// An empty bundle with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A bundle with a single item on the `main` channel — the shape used
    /// to seed a start node's input from a trigger payload.
    #[must_use]
    pub fn seed_main(item: Item) -> Self {
        let mut bundle = Self::new();
        bundle.push(MAIN, item);
        bundle
    }

    /// Appends an item to the end of a channel, creating the channel if
    /// it doesn't exist yet.
    pub fn push(&mut self, channel: impl Into<String>, item: Item) {
        self.channels.entry(channel.into()).or_default().push(item);
    }

    /// Appends every item from `items` to `channel`, preserving their
    /// relative order.
    pub fn extend(&mut self, channel: impl Into<String>, items: impl IntoIterator<Item = Item>) {
        self.channels.entry(channel.into()).or_default().extend(items);
    }

    /// Returns the items on a channel, or an empty slice if the channel
    /// was never written.
    #[must_use]
    pub fn channel(&self, name: &str) -> &[Item] {
        self.channels.get(name).map_or(&[], Vec::as_slice)
    }

    /// Returns the items on the `main` channel.
    #[must_use]
    pub fn main(&self) -> &[Item] {
        self.channel(MAIN)
    }

    /// Returns every channel name currently present.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Returns true if no channel holds any items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.values().all(Vec::is_empty)
    }

    /// Total number of items across every channel.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    /// Rejects output containing reserved/prototype-pollution keys at any
    /// depth of any item: `__proto__`, `constructor`, `prototype`.
    ///
    /// # Errors
    ///
    /// Returns the offending key name.
    pub fn check_no_reserved_keys(&self) -> Result<(), String> {
        for items in self.channels.values() {
            for item in items {
                check_value_no_reserved_keys(item)?;
            }
        }
        Ok(())
    }
}

const RESERVED_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

fn check_value_no_reserved_keys(value: &JsonValue) -> Result<(), String> {
    match value {
        JsonValue::Object(map) => {
            for (key, nested) in map {
                if RESERVED_KEYS.contains(&key.as_str()) {
                    return Err(key.clone());
                }
                check_value_no_reserved_keys(nested)?;
            }
            Ok(())
        }
        JsonValue::Array(items) => {
            for item in items {
                check_value_no_reserved_keys(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seed_main_creates_single_item() {
        let bundle = Bundle::seed_main(json!({"x": 1}));
        assert_eq!(bundle.main(), &[json!({"x": 1})]);
    }

    #[test]
    fn push_appends_in_order() {
        let mut bundle = Bundle::new();
        bundle.push(MAIN, json!(1));
        bundle.push(MAIN, json!(2));
        bundle.push(MAIN, json!(3));
        assert_eq!(bundle.main(), &[json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn unknown_channel_is_empty() {
        let bundle = Bundle::new();
        assert!(bundle.channel("nope").is_empty());
    }

    #[test]
    fn extend_preserves_source_order() {
        let mut bundle = Bundle::new();
        bundle.extend("main", vec![json!("a"), json!("b")]);
        bundle.extend("main", vec![json!("c")]);
        assert_eq!(bundle.main(), &[json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn detects_reserved_key_at_top_level() {
        let bundle = Bundle::seed_main(json!({"__proto__": {}}));
        assert_eq!(bundle.check_no_reserved_keys(), Err("__proto__".to_string()));
    }

    #[test]
    fn detects_reserved_key_nested() {
        let bundle = Bundle::seed_main(json!({"a": {"b": [{"constructor": 1}]}}));
        assert_eq!(bundle.check_no_reserved_keys(), Err("constructor".to_string()));
    }

    #[test]
    fn accepts_clean_output() {
        let bundle = Bundle::seed_main(json!({"a": 1, "b": [1, 2, {"c": 3}]}));
        assert!(bundle.check_no_reserved_keys().is_ok());
    }

    #[test]
    fn bundle_serde_roundtrip() {
        let mut bundle = Bundle::new();
        bundle.push("main", json!(1));
        bundle.push("errors", json!("oops"));
        let json = serde_json::to_string(&bundle).unwrap();
        let parsed: Bundle = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, bundle);
    }
}
