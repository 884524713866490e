//! Shared types for the tool proxy.
//!
//! JSON-RPC envelope types, the MCP structures exchanged with downstream
//! tool servers, and the datasource record returned by the listing API.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// MCP protocol version sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `id` is optional because some servers answer notifications with an
/// envelope that carries no id.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: serde_json::Map<String, serde_json::Value>,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::Map::new(),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Client identification sent during `initialize`.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// A tool as advertised by a downstream service in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisedTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

impl AdvertisedTool {
    /// Content hash over description and input schema.
    ///
    /// Object keys are sorted recursively before hashing, so two schemas that
    /// differ only in key order hash identically. The tool name is not part of
    /// the hash: same schema under different names is detected by the
    /// registration engine.
    pub fn content_hash(&self) -> String {
        let normalized = serde_json::json!({
            "description": self.description,
            "inputSchema": self.input_schema,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical_string(&normalized).as_bytes());
        let hash = hasher.finalize();
        format!("{hash:x}")
    }
}

/// Result payload of `tools/list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<AdvertisedTool>,
}

/// Parameters of `tools/call`.
#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// Result payload of `tools/call`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenate all text content items, one per line.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|c| c.kind == "text")
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One content item of a tool result. Only text items are surfaced.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

// ─── Datasources ─────────────────────────────────────────────────────────────

/// A downstream service reachable through the platform's datasource proxy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DownstreamService {
    pub id: i64,
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type")]
    pub service_type: String,
}

// ─── Canonical JSON ──────────────────────────────────────────────────────────

/// Serialize a value with object keys in sorted order, regardless of the map
/// implementation `serde_json` was compiled with.
fn canonical_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_string(v)
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_string).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, description: &str, schema: serde_json::Value) -> AdvertisedTool {
        AdvertisedTool {
            name: name.into(),
            description: description.into(),
            input_schema: schema,
        }
    }

    #[test]
    fn test_json_rpc_request_omits_missing_params() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_initialize_params_shape() {
        let params = serde_json::to_value(InitializeParams::default()).unwrap();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert!(params["capabilities"].as_object().unwrap().is_empty());
        assert_eq!(params["clientInfo"]["name"], env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn test_identical_tools_hash_identically() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"query": {"type": "string"}}
        });
        let a = tool("trace-search", "Search traces", schema.clone());
        let b = tool("trace-search", "Search traces", schema);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = tool(
            "t",
            "d",
            serde_json::from_str(
                r#"{"type":"object","properties":{"a":{"type":"string"},"b":{"type":"number"}},"required":["a"]}"#,
            )
            .unwrap(),
        );
        let b = tool(
            "t",
            "d",
            serde_json::from_str(
                r#"{"required":["a"],"properties":{"b":{"type":"number"},"a":{"type":"string"}},"type":"object"}"#,
            )
            .unwrap(),
        );
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_hash_ignores_tool_name() {
        let a = tool("trace-search", "d", serde_json::json!({}));
        let b = tool("search-traces", "d", serde_json::json!({}));
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_hash_changes_with_description_or_schema() {
        let base = tool("t", "A test tool", serde_json::json!({"type": "string"}));
        let other_desc = tool("t", "A different tool", serde_json::json!({"type": "string"}));
        let other_schema = tool("t", "A test tool", serde_json::json!({"type": "number"}));
        assert_ne!(base.content_hash(), other_desc.content_hash());
        assert_ne!(base.content_hash(), other_schema.content_hash());
    }

    #[test]
    fn test_array_order_is_significant() {
        let a = tool("t", "d", serde_json::json!({"required": ["a", "b"]}));
        let b = tool("t", "d", serde_json::json!({"required": ["b", "a"]}));
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_list_tools_result_deserialization() {
        let json = r#"{"tools":[{"name":"trace-search","description":"Search","inputSchema":{"type":"object"}}]}"#;
        let result: ListToolsResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].name, "trace-search");
        assert_eq!(result.tools[0].input_schema["type"], "object");
    }

    #[test]
    fn test_call_tool_result_text_joins_text_items() {
        let json = r#"{"content":[
            {"type":"text","text":"first"},
            {"type":"image","data":"..."},
            {"type":"text","text":"second"}
        ]}"#;
        let result: CallToolResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.text(), "first\nsecond");
        assert!(!result.is_error);
    }

    #[test]
    fn test_downstream_service_deserialization() {
        let json = r#"{"id":7,"uid":"tempo-prod","name":"Tempo Prod","url":"http://tempo:3200","type":"tempo","access":"proxy"}"#;
        let svc: DownstreamService = serde_json::from_str(json).unwrap();
        assert_eq!(svc.id, 7);
        assert_eq!(svc.uid, "tempo-prod");
        assert_eq!(svc.service_type, "tempo");
    }
}
