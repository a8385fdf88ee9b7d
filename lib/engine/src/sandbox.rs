//! The node sandbox: runs exactly one node's logic.
//!
//! Given a node definition, a resolved input bundle, and a handle to the
//! credential vault, the sandbox resolves parameters, injects credentials,
//! enforces resource caps and outbound-network safety, hands off to the
//! node type's executor, and validates the result before handing a bundle
//! back to the Flow Execution Engine. The engine never inspects a node's
//! parameters or credentials directly — this is the only place that does.

use crate::bundle::{Bundle, MAIN};
use crate::catalog::NodeTypeDescriptor;
use crate::error::{ErrorKind, SandboxError};
use crate::node::Node;
use async_trait::async_trait;
use flowcore_integration::credential::{CredentialData, CredentialVault};
use flowcore_integration::masking::mask_sensitive;
use flowcore_core::{UserId, WorkflowRunId};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Resource caps enforced on a single node invocation, per §4.3/§6.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceCaps {
    pub wall_clock: Duration,
    pub memory_bytes: u64,
    pub output_bytes: u64,
    pub max_concurrent_requests: u32,
    pub request_timeout: Duration,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(30),
            memory_bytes: 128 * 1024 * 1024,
            output_bytes: 10 * 1024 * 1024,
            max_concurrent_requests: 5,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Where user variables live: workflow-scoped and user-scoped maps
/// consulted by `$vars.<name>`, plus a run-local scratch space for
/// `$local.<name>`.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    workflow: HashMap<String, JsonValue>,
    user: HashMap<String, JsonValue>,
    local: HashMap<String, JsonValue>,
}

impl VariableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_workflow_var(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.workflow.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_user_var(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.user.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_local_var(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.local.insert(name.into(), value);
        self
    }

    /// `$vars.<name>` resolves workflow-scoped first, then user-scoped.
    fn resolve_vars(&self, name: &str) -> Option<&JsonValue> {
        self.workflow.get(name).or_else(|| self.user.get(name))
    }

    fn resolve_local(&self, name: &str) -> Option<&JsonValue> {
        self.local.get(name)
    }
}

/// Finds every `{{ ... }}` placeholder in `s`, returning `(start, end,
/// trimmed inner text)` byte ranges. Nested `{{` inside an outer
/// placeholder is captured as part of the inner text of the outer match
/// (the first `}}` always closes the match), which is deliberate: such a
/// placeholder fails [`is_pure_reference`] and is left untouched.
fn find_placeholders(s: &str) -> Vec<(usize, usize, String)> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some(rel_start) = s[cursor..].find("{{") {
        let start = cursor + rel_start;
        let after_open = start + 2;
        let Some(rel_end) = s[after_open..].find("}}") else {
            break;
        };
        let inner_end = after_open + rel_end;
        let end = inner_end + 2;
        found.push((start, end, s[after_open..inner_end].trim().to_string()));
        cursor = end;
    }
    found
}

/// A placeholder body is a "pure value reference" if it is exactly one of
/// `$vars.<path>`, `$local.<path>`, or `json.<path>` with no whitespace,
/// operators, or nested placeholders — the conservative subset the core
/// substitutes itself rather than handing to node-type logic.
fn is_pure_reference(inner: &str) -> bool {
    if inner.contains("{{") || inner.contains("}}") {
        return false;
    }
    if inner.is_empty() || inner.chars().any(char::is_whitespace) {
        return false;
    }
    let rest = if let Some(r) = inner.strip_prefix("$vars.") {
        r
    } else if let Some(r) = inner.strip_prefix("$local.") {
        r
    } else if let Some(r) = inner.strip_prefix("json.") {
        r
    } else {
        return false;
    };
    !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '[' | ']' | '\'' | '"'))
}

enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parses a dot/bracket path (`a.b[0].c`) into segments.
fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                let mut index = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    index.push(c);
                }
                let trimmed = index.trim_matches(|c| c == '\'' || c == '"');
                if let Ok(i) = trimmed.parse::<usize>() {
                    segments.push(PathSegment::Index(i));
                } else if !trimmed.is_empty() {
                    segments.push(PathSegment::Key(trimmed.to_string()));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    segments
}

fn resolve_json_path(root: &JsonValue, path: &str) -> Option<JsonValue> {
    let mut current = root;
    for segment in parse_path(path) {
        current = match segment {
            PathSegment::Key(key) => current.get(&key)?,
            PathSegment::Index(index) => current.get(index)?,
        };
    }
    Some(current.clone())
}

fn resolve_reference(inner: &str, vars: &VariableStore, input_item: &JsonValue) -> Option<JsonValue> {
    if let Some(name) = inner.strip_prefix("$vars.") {
        vars.resolve_vars(name).cloned()
    } else if let Some(name) = inner.strip_prefix("$local.") {
        vars.resolve_local(name).cloned()
    } else if let Some(path) = inner.strip_prefix("json.") {
        resolve_json_path(input_item, path)
    } else {
        None
    }
}

fn json_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_string(s: &str, vars: &VariableStore, input_item: &JsonValue) -> JsonValue {
    let placeholders = find_placeholders(s);
    if placeholders.is_empty() {
        return JsonValue::String(s.to_string());
    }

    if placeholders.len() == 1 && placeholders[0].0 == 0 && placeholders[0].1 == s.len() {
        let inner = &placeholders[0].2;
        if is_pure_reference(inner) {
            return match resolve_reference(inner, vars, input_item) {
                Some(value) => value,
                None => {
                    tracing::warn!(expr = %inner, "unresolved placeholder, keeping literal text");
                    JsonValue::String(s.to_string())
                }
            };
        }
        return JsonValue::String(s.to_string());
    }

    let mut result = String::with_capacity(s.len());
    let mut last = 0;
    for (start, end, inner) in &placeholders {
        result.push_str(&s[last..*start]);
        if is_pure_reference(inner) {
            match resolve_reference(inner, vars, input_item) {
                Some(value) => result.push_str(&json_to_text(&value)),
                None => {
                    tracing::warn!(expr = %inner, "unresolved placeholder, keeping literal text");
                    result.push_str(&s[*start..*end]);
                }
            }
        } else {
            result.push_str(&s[*start..*end]);
        }
        last = *end;
    }
    result.push_str(&s[last..]);
    JsonValue::String(result)
}

fn resolve_value(value: &JsonValue, vars: &VariableStore, input_item: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) => resolve_string(s, vars, input_item),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, vars, input_item)))
                .collect(),
        ),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| resolve_value(v, vars, input_item)).collect())
        }
        other => other.clone(),
    }
}

/// Resolves `{{ }}` placeholders in a node's parameters against the
/// variable store and the current input item, per §4.3's substitution
/// grammar.
#[must_use]
pub fn resolve_parameters(parameters: &JsonValue, vars: &VariableStore, input_item: &JsonValue) -> JsonValue {
    resolve_value(parameters, vars, input_item)
}

/// Denies a URL unless it's `http(s)` and does not resolve to a private,
/// loopback, or link-local host — unless `allow_private_networks` is set.
///
/// # Errors
///
/// Returns [`SandboxError`] with kind [`ErrorKind::Security`] if the URL
/// is not http(s), or targets a disallowed host.
pub fn check_outbound_url(raw_url: &str, allow_private_networks: bool) -> Result<url::Url, SandboxError> {
    let parsed = url::Url::parse(raw_url)
        .map_err(|e| SandboxError::security(format!("invalid URL: {e}")))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(SandboxError::security(format!(
            "scheme '{}' is not allowed; only http/https",
            parsed.scheme()
        )));
    }

    if allow_private_networks {
        return Ok(parsed);
    }

    let Some(host) = parsed.host() else {
        return Err(SandboxError::security("URL has no host"));
    };

    let denied = match host {
        url::Host::Domain(domain) => {
            domain.eq_ignore_ascii_case("localhost") || domain.ends_with(".local")
        }
        url::Host::Ipv4(ip) => {
            ip.is_loopback() || ip.is_link_local() || ip.is_private() || ip.is_unspecified()
        }
        url::Host::Ipv6(ip) => ip.is_loopback() || ip.is_unspecified(),
    };

    if denied {
        return Err(SandboxError::security(format!(
            "outbound request to '{host}' is denied by network-safety policy"
        )));
    }

    Ok(parsed)
}

/// Checks a user-supplied header name against the whitelist of headers a
/// node is allowed to set explicitly (as opposed to ones the HTTP client
/// itself manages, like `Host` or `Content-Length`).
const HEADER_WHITELIST: &[&str] = &[
    "accept",
    "authorization",
    "content-type",
    "user-agent",
    "x-api-key",
    "x-request-id",
];

#[must_use]
pub fn is_allowed_header(name: &str) -> bool {
    HEADER_WHITELIST.contains(&name.to_ascii_lowercase().as_str())
}

const RESERVED_OUTPUT_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Validates a node type's raw output JSON and normalizes it into a
/// [`Bundle`].
///
/// Accepts `{main: Item[]}` for ordinary nodes, or `{<branch>: Item[],
/// ...}` for branching node types. Rejects output containing reserved
/// prototype-pollution keys at any depth.
///
/// # Errors
///
/// Returns [`SandboxError`] with kind [`ErrorKind::Security`] for a
/// reserved key, or [`ErrorKind::Validation`] for a malformed shape.
pub fn validate_output(raw: JsonValue, output_cap_bytes: u64) -> Result<Bundle, SandboxError> {
    check_no_reserved_keys(&raw)?;

    let approx_size = serde_json::to_vec(&raw).map(|v| v.len() as u64).unwrap_or(0);
    if approx_size > output_cap_bytes {
        return Err(SandboxError::resource_limit(format!(
            "output size {approx_size} bytes exceeds cap {output_cap_bytes} bytes"
        )));
    }

    let JsonValue::Object(map) = raw else {
        return Err(SandboxError::validation("node output must be a JSON object of channel -> items"));
    };

    let mut bundle = Bundle::new();
    for (channel, items) in map {
        let JsonValue::Array(items) = items else {
            return Err(SandboxError::validation(format!(
                "channel '{channel}' must be an array of items"
            )));
        };
        bundle.extend(channel, items);
    }

    Ok(bundle)
}

fn check_no_reserved_keys(value: &JsonValue) -> Result<(), SandboxError> {
    match value {
        JsonValue::Object(map) => {
            for (key, nested) in map {
                if RESERVED_OUTPUT_KEYS.contains(&key.as_str()) {
                    return Err(SandboxError::security(format!("reserved key '{key}' in node output")));
                }
                check_no_reserved_keys(nested)?;
            }
            Ok(())
        }
        JsonValue::Array(items) => {
            for item in items {
                check_no_reserved_keys(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Resolved secrets for a node's credential slots, keyed by slot name,
/// masked wherever they might end up in a log.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCredentials {
    secrets: HashMap<String, CredentialData>,
}

impl ResolvedCredentials {
    #[must_use]
    pub fn get(&self, slot: &str) -> Option<&CredentialData> {
        self.secrets.get(slot)
    }

    /// A redacted view safe to attach to a log line or event payload:
    /// slot names with their credential *type* only, never the secret.
    #[must_use]
    pub fn masked_summary(&self) -> JsonValue {
        JsonValue::Object(
            self.secrets
                .iter()
                .map(|(slot, data)| (slot.clone(), JsonValue::String(format!("{:?}", data.credential_type()))))
                .collect(),
        )
    }
}

/// Resolves every credential slot a node declares, fetching secrets
/// through the vault's audited `get_for_execution`.
///
/// # Errors
///
/// Returns [`SandboxError`] with kind [`ErrorKind::Auth`] if a required
/// credential slot can't be resolved.
pub async fn inject_credentials(
    node: &Node,
    vault: &dyn CredentialVault,
    execution_id: WorkflowRunId,
    user_id: UserId,
) -> Result<ResolvedCredentials, SandboxError> {
    let mut secrets = HashMap::new();
    for (slot, credential_id) in &node.credentials {
        let data = vault
            .get_for_execution(execution_id, *credential_id, user_id)
            .await
            .map_err(|e| SandboxError::auth(format!("credential slot '{slot}': {e}")))?;
        secrets.insert(slot.clone(), data);
    }
    Ok(ResolvedCredentials { secrets })
}

/// A cooperative cancellation signal shared between the engine and a
/// single sandbox invocation. Checked at suspension points; never forces
/// CPU-bound work to stop mid-instruction.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    cancelled: std::sync::Arc<AtomicBool>,
}

impl CancellationSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The pluggable executor behind a node type's `execute` operation.
///
/// Kept separate from [`crate::catalog::NodeTypeCatalog`] (which only
/// describes a node type's shape): this is the behavior half. An
/// implementation might run an embedded interpreter, shell out to a
/// sandboxed subprocess, or invoke a WASM module — the engine and sandbox
/// don't care which, as long as it honors the cancellation signal.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Runs a node type's logic against resolved parameters and an input
    /// item, returning the raw (unvalidated) output JSON.
    async fn execute(
        &self,
        node_type: &str,
        parameters: &JsonValue,
        input_item: &JsonValue,
        credentials: &ResolvedCredentials,
        cancellation: &CancellationSignal,
    ) -> Result<JsonValue, SandboxError>;
}

/// Runs a single node invocation end to end: parameter resolution,
/// credential injection, the node type's executor, and output validation.
pub struct Sandbox<'a> {
    pub caps: ResourceCaps,
    pub catalog_entry: &'a NodeTypeDescriptor,
    pub executor: &'a dyn NodeExecutor,
    pub vault: &'a dyn CredentialVault,
}

impl<'a> Sandbox<'a> {
    /// Runs `node` against a single input item, producing a validated
    /// output [`Bundle`].
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError`] from parameter resolution, credential
    /// injection, the node type's executor, or output validation — the
    /// caller (the Flow Execution Engine) inspects `.kind` to decide
    /// whether to retry.
    pub async fn run(
        &self,
        node: &Node,
        input_item: &JsonValue,
        vars: &VariableStore,
        execution_id: WorkflowRunId,
        user_id: UserId,
        cancellation: &CancellationSignal,
    ) -> Result<Bundle, SandboxError> {
        if node.has_mock_data() {
            let mock = node.mock_data.clone().unwrap_or(JsonValue::Null);
            return validate_output(
                JsonValue::Object(serde_json::Map::from_iter([(MAIN.to_string(), JsonValue::Array(vec![mock]))])),
                self.caps.output_bytes,
            );
        }

        let resolved_parameters = resolve_parameters(&node.parameters, vars, input_item);
        let credentials = inject_credentials(node, self.vault, execution_id, user_id).await?;
        tracing::debug!(
            %execution_id,
            node_id = %node.id,
            node_type = %self.catalog_entry.type_name,
            parameters = %mask_sensitive(&resolved_parameters),
            credentials = %credentials.masked_summary(),
            "dispatching node to executor"
        );

        if cancellation.is_cancelled() {
            return Err(SandboxError::new(ErrorKind::Transient, "cancelled before dispatch"));
        }

        let timeout_result = tokio::time::timeout(
            self.caps.wall_clock,
            self.executor.execute(
                &self.catalog_entry.type_name,
                &resolved_parameters,
                input_item,
                &credentials,
                cancellation,
            ),
        )
        .await;

        let raw_output = match timeout_result {
            Ok(result) => result?,
            Err(_) => return Err(SandboxError::new(ErrorKind::Transient, "node execution timed out")),
        };

        validate_output(raw_output, self.caps.output_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pure_whole_string_reference_unwraps_type() {
        let vars = VariableStore::new().with_workflow_var("count", json!(3));
        let resolved = resolve_parameters(&json!("{{ $vars.count }}"), &vars, &json!({}));
        assert_eq!(resolved, json!(3));
    }

    #[test]
    fn json_path_resolves_against_input_item() {
        let vars = VariableStore::new();
        let input = json!({"user": {"name": "ada"}, "items": [10, 20]});
        assert_eq!(
            resolve_parameters(&json!("{{ json.user.name }}"), &vars, &input),
            json!("ada")
        );
        assert_eq!(resolve_parameters(&json!("{{ json.items[1] }}"), &vars, &input), json!(20));
    }

    #[test]
    fn unresolved_reference_keeps_literal_text() {
        let vars = VariableStore::new();
        let resolved = resolve_parameters(&json!("{{ $vars.missing }}"), &vars, &json!({}));
        assert_eq!(resolved, json!("{{ $vars.missing }}"));
    }

    #[test]
    fn operator_bearing_placeholder_is_left_marked() {
        let vars = VariableStore::new().with_workflow_var("count", json!(3));
        let resolved = resolve_parameters(&json!("{{ $vars.count + 1 }}"), &vars, &json!({}));
        assert_eq!(resolved, json!("{{ $vars.count + 1 }}"));
    }

    #[test]
    fn embedded_placeholder_substitutes_text_inline() {
        let vars = VariableStore::new().with_workflow_var("name", json!("ada"));
        let resolved = resolve_parameters(&json!("hello {{ $vars.name }}!"), &vars, &json!({}));
        assert_eq!(resolved, json!("hello ada!"));
    }

    #[test]
    fn resolve_walks_nested_objects_and_arrays() {
        let vars = VariableStore::new().with_local_var("x", json!(42));
        let params = json!({"a": [{"b": "{{ $local.x }}"}]});
        let resolved = resolve_parameters(&params, &vars, &json!({}));
        assert_eq!(resolved["a"][0]["b"], json!(42));
    }

    #[test]
    fn outbound_url_denies_loopback_by_default() {
        let result = check_outbound_url("http://127.0.0.1:8080/admin", false);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::Security);
    }

    #[test]
    fn outbound_url_denies_private_range() {
        assert!(check_outbound_url("http://10.0.0.5/", false).is_err());
        assert!(check_outbound_url("http://192.168.1.1/", false).is_err());
    }

    #[test]
    fn outbound_url_allows_private_when_policy_set() {
        assert!(check_outbound_url("http://10.0.0.5/", true).is_ok());
    }

    #[test]
    fn outbound_url_allows_public_host() {
        assert!(check_outbound_url("https://api.example.com/v1", false).is_ok());
    }

    #[test]
    fn outbound_url_rejects_non_http_scheme() {
        let result = check_outbound_url("file:///etc/passwd", false);
        assert!(result.is_err());
    }

    #[test]
    fn header_whitelist_allows_known_headers_case_insensitively() {
        assert!(is_allowed_header("Content-Type"));
        assert!(is_allowed_header("x-api-key"));
        assert!(!is_allowed_header("x-forwarded-host"));
    }

    #[test]
    fn validate_output_rejects_reserved_key() {
        let raw = json!({"main": [{"__proto__": {}}]});
        let result = validate_output(raw, 1024 * 1024);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::Security);
    }

    #[test]
    fn validate_output_accepts_main_channel() {
        let raw = json!({"main": [{"x": 1}, {"x": 2}]});
        let bundle = validate_output(raw, 1024 * 1024).expect("valid");
        assert_eq!(bundle.main().len(), 2);
    }

    #[test]
    fn validate_output_accepts_branching_channels() {
        let raw = json!({"true": [{"x": 1}], "false": []});
        let bundle = validate_output(raw, 1024 * 1024).expect("valid");
        assert_eq!(bundle.channel("true").len(), 1);
        assert!(bundle.channel("false").is_empty());
    }

    #[test]
    fn validate_output_rejects_non_object_root() {
        let result = validate_output(json!([1, 2, 3]), 1024 * 1024);
        assert!(result.is_err());
    }

    #[test]
    fn validate_output_enforces_size_cap() {
        let huge = "x".repeat(2048);
        let raw = json!({"main": [{"data": huge}]});
        let result = validate_output(raw, 128);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::ResourceLimit);
    }

    #[test]
    fn cancellation_signal_round_trips() {
        let signal = CancellationSignal::new();
        assert!(!signal.is_cancelled());
        signal.cancel();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn resolved_parameters_are_masked_before_they_would_reach_a_log() {
        let vars = VariableStore::new();
        let params = json!({"host": "api.example.com", "api_key": "sk-live-secret"});
        let resolved = resolve_parameters(&params, &vars, &json!({}));
        let masked = mask_sensitive(&resolved);
        assert_eq!(masked["host"], "api.example.com");
        assert_eq!(masked["api_key"], "***");
    }

    #[tokio::test]
    async fn masked_summary_never_exposes_the_resolved_secret() {
        use flowcore_integration::credential::{Credential, CredentialData, CredentialType, InMemoryCredentialVault};

        let vault = InMemoryCredentialVault::new();
        let user_id = UserId::new();
        let credential = Credential::new(
            flowcore_core::IntegrationAccountId::new(),
            user_id,
            "slack",
            CredentialType::ApiKey,
        );
        let credential_id = vault
            .store(credential, CredentialData::api_key("sk-live-secret"))
            .await
            .expect("store");

        let mut node = Node::new("noop", "Slack");
        node.credentials.insert("api".to_string(), credential_id);

        let resolved = inject_credentials(&node, &vault, WorkflowRunId::new(), user_id)
            .await
            .expect("resolve");
        let summary = resolved.masked_summary().to_string();
        assert!(summary.contains("ApiKey") || summary.contains("api_key"));
        assert!(!summary.contains("sk-live-secret"));
    }
}
