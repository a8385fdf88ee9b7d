//! Secret masking for logs and other free-form output.
//!
//! The node sandbox and the runtime's structured logging both need to keep
//! credential material out of anything a human might read. This module
//! centralizes the masking rule so both call sites apply it identically.

use serde_json::Value as JsonValue;

/// Substrings that mark a key as holding sensitive data, matched
/// case-insensitively.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &["password", "secret", "key", "token", "private"];

/// The literal replacement written in place of a masked value.
pub const MASK_PLACEHOLDER: &str = "***";

/// Returns true if `key` looks like it names sensitive data.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

/// Recursively masks values under sensitive keys in a JSON tree.
///
/// Used to sanitize node parameters, credential data, and sandbox output
/// before they are attached to a log line or event payload.
#[must_use]
pub fn mask_sensitive(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let masked = map
                .iter()
                .map(|(k, v)| {
                    let masked_value = if is_sensitive_key(k) {
                        JsonValue::String(MASK_PLACEHOLDER.to_string())
                    } else {
                        mask_sensitive(v)
                    };
                    (k.clone(), masked_value)
                })
                .collect();
            JsonValue::Object(masked)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(mask_sensitive).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_sensitive_keys_case_insensitively() {
        assert!(is_sensitive_key("password"));
        assert!(is_sensitive_key("API_KEY"));
        assert!(is_sensitive_key("AccessToken"));
        assert!(is_sensitive_key("Private-Cert"));
        assert!(!is_sensitive_key("folder"));
    }

    #[test]
    fn masks_top_level_sensitive_field() {
        let input = json!({"username": "alice", "password": "hunter2"});
        let masked = mask_sensitive(&input);
        assert_eq!(masked["username"], "alice");
        assert_eq!(masked["password"], MASK_PLACEHOLDER);
    }

    #[test]
    fn masks_nested_sensitive_fields() {
        let input = json!({
            "auth": {"api_key": "sk-live-123", "scope": "read"},
            "items": [{"token": "abc"}, {"value": 1}],
        });
        let masked = mask_sensitive(&input);
        assert_eq!(masked["auth"]["api_key"], MASK_PLACEHOLDER);
        assert_eq!(masked["auth"]["scope"], "read");
        assert_eq!(masked["items"][0]["token"], MASK_PLACEHOLDER);
        assert_eq!(masked["items"][1]["value"], 1);
    }
}
