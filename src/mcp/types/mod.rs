//! MCP message types
//!
//! JSON-RPC envelopes plus the subset of MCP payloads exchanged with
//! downstream servers and front clients.

use crate::mcp::errors::McpError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// JSON-RPC protocol version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Schema used when a downstream tool publishes no input schema
fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// MCP Request message (a notification when `id` is absent)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID (string or number); absent for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    pub fn new(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// MCP Response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID this responds to; null when the request could not be parsed
    #[serde(default)]
    pub id: Value,
    /// Result (if successful)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (if failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

impl McpResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: McpError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A message read off a downstream transport
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Response(McpResponse),
    /// Server-to-client request or notification
    Request(McpRequest),
}

impl IncomingMessage {
    pub fn parse(value: Value) -> serde_json::Result<Self> {
        if value.get("method").is_some() {
            Ok(IncomingMessage::Request(serde_json::from_value(value)?))
        } else {
            Ok(IncomingMessage::Response(serde_json::from_value(value)?))
        }
    }
}

/// Key for matching responses to pending requests regardless of id type
pub fn request_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One callable operation discovered from a downstream server (`tools/list` entry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSchema {
    /// Tool name (unique identifier)
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for input parameters
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

/// `tools/list` result
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<OperationSchema>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

/// `tools/call` result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": text.into() })],
            is_error: false,
        }
    }

    /// Error text result
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": text.into() })],
            is_error: true,
        }
    }

    /// Flatten the content blocks into text. Non-text blocks are rendered as JSON.
    pub fn to_text(&self) -> String {
        let parts: Vec<String> = self
            .content
            .iter()
            .map(|block| match block.get("text").and_then(Value::as_str) {
                Some(text) if block.get("type").and_then(Value::as_str) == Some("text") => {
                    text.to_string()
                }
                _ => block.to_string(),
            })
            .collect();
        if self.is_error {
            format!("[Tool Error] {}", parts.join(" "))
        } else {
            parts.join("\n")
        }
    }
}
