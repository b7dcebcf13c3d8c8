//! Front-facing MCP server
//!
//! Publishes one tool per configured downstream server, each taking a
//! single `instruction` string, and answers `tools/call` by running the
//! orchestrator. Messages are newline-delimited JSON-RPC; every call runs
//! in its own task so slow invocations never block the reader.

use crate::agent::{InvocationOrchestrator, InvocationResult};
use crate::error::Result;
use crate::mcp::errors::{McpError, McpErrorCode};
use crate::mcp::types::{request_key, CallToolResult, McpRequest, McpResponse};
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Protocol versions this server can speak, newest first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

type SharedWriter<W> = Arc<Mutex<W>>;

/// A validated `tools/call` ready to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub server: String,
    pub instruction: String,
}

/// MCP server exposing the registry as instruction tools
pub struct McpServer {
    orchestrator: Arc<InvocationOrchestrator>,
    /// Cancellation tokens of in-flight calls keyed by request id
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl McpServer {
    pub fn new(orchestrator: Arc<InvocationOrchestrator>) -> Self {
        Self {
            orchestrator,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// One tool per downstream server
    pub fn list_tools(&self) -> Vec<Value> {
        self.orchestrator
            .registry()
            .descriptors()
            .map(|descriptor| {
                json!({
                    "name": descriptor.name,
                    "description": descriptor.description,
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "instruction": {
                                "type": "string",
                                "description": format!(
                                    "Natural-language instruction for the {} agent",
                                    descriptor.name
                                )
                            }
                        },
                        "required": ["instruction"]
                    }
                })
            })
            .collect()
    }

    fn initialize_result(&self, params: Option<&Value>) -> Value {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let version = requested
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]);
        json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        })
    }

    /// Validate `tools/call` parameters
    pub fn prepare_call(&self, params: Option<&Value>) -> std::result::Result<PendingCall, McpError> {
        let params = params.ok_or_else(|| McpError::invalid_params("Missing params"))?;
        let server = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::invalid_params("Missing tool name"))?;
        if self.orchestrator.registry().lookup(server).is_none() {
            return Err(McpError::invalid_params(format!("Unknown tool: {}", server)));
        }
        let instruction = params
            .get("arguments")
            .and_then(|args| args.get("instruction"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                McpError::invalid_params("Argument 'instruction' must be a string")
            })?;
        Ok(PendingCall {
            server: server.to_string(),
            instruction: instruction.to_string(),
        })
    }

    /// Handle everything except `tools/call`. `None` means no reply is due.
    pub async fn handle_request(&self, request: &McpRequest) -> Option<McpResponse> {
        debug!("Handling MCP method: {}", request.method);
        let id = request.id.clone();
        match request.method.as_str() {
            "initialize" => {
                let result = self.initialize_result(request.params.as_ref());
                id.map(|id| McpResponse::success(id, result))
            }
            "notifications/initialized" => None,
            "notifications/cancelled" => {
                if let Some(request_id) = request.params.as_ref().and_then(|p| p.get("requestId")) {
                    self.cancel(request_id).await;
                }
                None
            }
            "ping" => id.map(|id| McpResponse::success(id, json!({}))),
            "tools/list" => id.map(|id| McpResponse::success(id, json!({ "tools": self.list_tools() }))),
            method => match id {
                Some(id) => Some(McpResponse::error(id, McpError::method_not_found(method))),
                None => {
                    debug!("Ignoring notification: {}", method);
                    None
                }
            },
        }
    }

    async fn cancel(&self, request_id: &Value) {
        let key = request_key(request_id);
        match self.in_flight.lock().await.get(&key) {
            Some(token) => {
                info!("Cancelling in-flight call {}", key);
                token.cancel();
            }
            None => debug!("Cancellation for unknown or finished call {}", key),
        }
    }

    /// Serve newline-delimited JSON-RPC until the reader reaches EOF.
    /// In-flight calls are awaited before returning.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));
        let mut lines = BufReader::new(reader).lines();
        let mut calls = JoinSet::new();

        info!(
            "Serving {} tool(s) over stdio",
            self.orchestrator.registry().len()
        );

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from stdin: {}", e);
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request = match parse_line(trimmed) {
                Ok(request) => request,
                Err(response) => {
                    write_response(&writer, &response).await;
                    continue;
                }
            };

            if request.method == "tools/call" {
                let Some(id) = request.id.clone() else {
                    warn!("Ignoring tools/call sent as a notification");
                    continue;
                };
                match self.prepare_call(request.params.as_ref()) {
                    Ok(call) => {
                        let token = CancellationToken::new();
                        self.in_flight
                            .lock()
                            .await
                            .insert(request_key(&id), token.clone());
                        let server = Arc::clone(&self);
                        let writer = Arc::clone(&writer);
                        calls.spawn(async move {
                            let response = server.run_call(id, call, token).await;
                            write_response(&writer, &response).await;
                        });
                    }
                    Err(error) => write_response(&writer, &McpResponse::error(id, error)).await,
                }
                // Reap finished calls so the set does not grow unbounded
                while let Some(Some(_)) = calls.join_next().now_or_never() {}
                continue;
            }

            if let Some(response) = self.handle_request(&request).await {
                write_response(&writer, &response).await;
            }
        }

        if !calls.is_empty() {
            info!("Waiting for {} in-flight call(s)", calls.len());
        }
        while let Some(joined) = calls.join_next().await {
            if let Err(e) = joined {
                error!("Tool call task failed: {}", e);
            }
        }
        Ok(())
    }

    /// Serve on the process stdin/stdout
    pub async fn serve_stdio(self: Arc<Self>) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    async fn run_call(&self, id: Value, call: PendingCall, token: CancellationToken) -> McpResponse {
        debug!(
            "[{}] Handler called: {}",
            call.server,
            call.instruction.chars().take(200).collect::<String>()
        );
        let outcome = self
            .orchestrator
            .invoke(&call.server, &call.instruction, token)
            .await;
        self.in_flight.lock().await.remove(&request_key(&id));

        McpResponse::success(id, tool_result_json(&outcome))
    }
}

/// Render an invocation outcome as a `tools/call` result
pub fn tool_result_json(outcome: &InvocationResult) -> Value {
    let result = match outcome {
        InvocationResult::Completed { text } => CallToolResult::text(text.clone()),
        failed => CallToolResult::error_text(failed.to_string()),
    };
    serde_json::to_value(result).unwrap_or_else(|_| json!({ "content": [], "isError": true }))
}

/// Parse one line, or produce the error response to send back
fn parse_line(line: &str) -> std::result::Result<McpRequest, McpResponse> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        McpResponse::error(
            Value::Null,
            McpError::new(McpErrorCode::ParseError, format!("Invalid JSON: {}", e)),
        )
    })?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        McpResponse::error(
            id,
            McpError::new(McpErrorCode::InvalidRequest, format!("Invalid request: {}", e)),
        )
    })
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &SharedWriter<W>, response: &McpResponse) {
    let line = match serde_json::to_string(response) {
        Ok(line) => line,
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            return;
        }
    };
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        debug!("Failed to write response (client likely disconnected): {}", e);
        return;
    }
    if let Err(e) = writer.write_all(b"\n").await {
        debug!("Failed to write response newline: {}", e);
        return;
    }
    if let Err(e) = writer.flush().await {
        debug!("Failed to flush response: {}", e);
    }
}
