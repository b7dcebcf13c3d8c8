//! Connection bridge to downstream MCP servers
//!
//! A connection is opened per invocation, performs the `initialize`
//! handshake, lists tools once, forwards tool calls and is closed exactly
//! when the invocation ends. Downstream tool failures come back as
//! [`OperationOutcome::Failed`]; only a broken transport is an `Err`.

use crate::auth::Credential;
use crate::config::McpClientConfig;
use crate::error::{AgentError, Result};
use crate::mcp::clients::StreamableHttpTransport;
use crate::mcp::errors::McpError;
use crate::mcp::external_process::StdioTransport;
use crate::mcp::types::{CallToolResult, ListToolsResult, McpRequest, McpResponse, OperationSchema};
use crate::registry::{LaunchSpec, ServerDescriptor};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, info, warn};

/// Upper bound on `tools/list` pages followed during discovery
const MAX_TOOL_PAGES: usize = 32;

/// Result of one downstream operation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Success(String),
    /// Downstream-reported or per-request failure, fed back to the LLM
    Failed(String),
}

/// A live session with one downstream server
#[async_trait]
pub trait McpConnection: Send {
    /// List the server's callable operations
    async fn discover_operations(&mut self) -> Result<Vec<OperationSchema>>;

    /// Call one operation. `Err` means the transport is unusable.
    async fn invoke(&mut self, name: &str, arguments: Value) -> Result<OperationOutcome>;

    /// Release transport resources. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens connections for descriptors
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        descriptor: &ServerDescriptor,
        credential: &Credential,
    ) -> Result<Box<dyn McpConnection>>;
}

/// Why a single JSON-RPC exchange failed
#[derive(Debug, Clone)]
pub enum RpcFailure {
    /// The transport is broken; the session cannot continue
    Transport(String),
    /// No response within the request timeout
    Timeout(String),
    /// The server answered with a JSON-RPC error
    Remote(McpError),
    /// The server answered with a non-success HTTP status
    Status { status: u16, body: String },
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcFailure::Transport(message) => write!(f, "transport failure: {}", message),
            RpcFailure::Timeout(message) => write!(f, "timed out: {}", message),
            RpcFailure::Remote(error) => write!(f, "{}", error),
            RpcFailure::Status { status, body } if body.is_empty() => write!(f, "HTTP {}", status),
            RpcFailure::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
        }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcFailure>;

/// Message exchange over one transport
#[async_trait]
pub trait RpcTransport: Send {
    /// Send a request and wait for its response
    async fn request(&mut self, request: McpRequest) -> RpcResult<McpResponse>;

    /// Send a notification
    async fn notify(&mut self, notification: McpRequest) -> RpcResult<()>;

    /// Record the protocol version agreed during `initialize`
    fn set_protocol_version(&mut self, _version: &str) {}

    /// Release the underlying resources
    async fn shutdown(&mut self);
}

/// MCP client session over any [`RpcTransport`]
pub struct McpSession<T: RpcTransport> {
    server_name: String,
    transport: T,
    next_id: u64,
    closed: bool,
}

impl<T: RpcTransport> McpSession<T> {
    /// Run the `initialize` handshake; the transport is shut down if it fails
    pub async fn establish(
        server_name: &str,
        transport: T,
        client_config: &McpClientConfig,
    ) -> Result<Self> {
        let mut session = Self {
            server_name: server_name.to_string(),
            transport,
            next_id: 1,
            closed: false,
        };
        if let Err(e) = session.initialize(client_config).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn initialize(&mut self, client_config: &McpClientConfig) -> Result<()> {
        let params = json!({
            "protocolVersion": client_config.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": client_config.client_name,
                "version": client_config.client_version
            }
        });

        let result = self.call("initialize", Some(params)).await.map_err(|failure| {
            match failure {
                RpcFailure::Status { status: 401, .. } | RpcFailure::Status { status: 403, .. } => {
                    AgentError::auth(format!(
                        "Server '{}' rejected the credential: {}",
                        self.server_name, failure
                    ))
                }
                other => AgentError::connection(format!(
                    "Initialize handshake with '{}' failed: {}",
                    self.server_name, other
                )),
            }
        })?;

        if let Some(version) = result.get("protocolVersion").and_then(Value::as_str) {
            if version != client_config.protocol_version {
                debug!(
                    "Server '{}' negotiated protocol version {} (requested {})",
                    self.server_name, version, client_config.protocol_version
                );
            }
            self.transport.set_protocol_version(version);
        }
        let server_info = result
            .get("serverInfo")
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!("Connected to '{}' (server: {})", self.server_name, server_info);

        self.transport
            .notify(McpRequest::notification("notifications/initialized", None))
            .await
            .map_err(|failure| {
                AgentError::connection(format!(
                    "Failed to send initialized notification to '{}': {}",
                    self.server_name, failure
                ))
            })
    }

    async fn call(&mut self, method: &str, params: Option<Value>) -> RpcResult<Value> {
        if self.closed {
            return Err(RpcFailure::Transport("session is closed".to_string()));
        }
        let id = self.next_id;
        self.next_id += 1;

        let response = self
            .transport
            .request(McpRequest::new(json!(id), method, params))
            .await?;
        if let Some(error) = response.error {
            return Err(RpcFailure::Remote(error));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl<T: RpcTransport> McpConnection for McpSession<T> {
    async fn discover_operations(&mut self) -> Result<Vec<OperationSchema>> {
        let mut operations = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.call("tools/list", Some(params)).await.map_err(|failure| {
                AgentError::connection(format!(
                    "Listing tools on '{}' failed: {}",
                    self.server_name, failure
                ))
            })?;
            let page: ListToolsResult = serde_json::from_value(result).map_err(|e| {
                AgentError::mcp(format!(
                    "Invalid tools/list result from '{}': {}",
                    self.server_name, e
                ))
            })?;
            operations.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        debug!("Server '{}' offers {} operation(s)", self.server_name, operations.len());
        Ok(operations)
    }

    async fn invoke(&mut self, name: &str, arguments: Value) -> Result<OperationOutcome> {
        let params = json!({ "name": name, "arguments": arguments });
        match self.call("tools/call", Some(params)).await {
            Ok(result) => {
                let result: CallToolResult = match serde_json::from_value(result) {
                    Ok(result) => result,
                    Err(e) => {
                        return Ok(OperationOutcome::Failed(format!(
                            "Invalid tools/call result: {}",
                            e
                        )))
                    }
                };
                let text = result.to_text();
                if result.is_error {
                    Ok(OperationOutcome::Failed(text))
                } else {
                    Ok(OperationOutcome::Success(text))
                }
            }
            Err(RpcFailure::Transport(message)) => Err(AgentError::connection(format!(
                "Connection to '{}' lost while calling '{}': {}",
                self.server_name, name, message
            ))),
            Err(failure) => {
                warn!("Tool '{}' on '{}' failed: {}", name, self.server_name, failure);
                Ok(OperationOutcome::Failed(format!(
                    "[Error calling tool {}]: {}",
                    name, failure
                )))
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.transport.shutdown().await;
        debug!("Closed connection to '{}'", self.server_name);
    }
}

/// Opens stdio and Streamable HTTP connections
#[derive(Debug, Clone)]
pub struct McpConnector {
    client_config: McpClientConfig,
}

impl McpConnector {
    pub fn new(client_config: McpClientConfig) -> Self {
        Self { client_config }
    }
}

#[async_trait]
impl Connector for McpConnector {
    async fn open(
        &self,
        descriptor: &ServerDescriptor,
        credential: &Credential,
    ) -> Result<Box<dyn McpConnection>> {
        info!("Connecting to '{}' ({})", descriptor.name, descriptor.transport);
        match &descriptor.launch {
            LaunchSpec::Stdio { .. } => {
                let transport = StdioTransport::spawn(descriptor, &self.client_config)?;
                let session =
                    McpSession::establish(&descriptor.name, transport, &self.client_config).await?;
                Ok(Box::new(session))
            }
            LaunchSpec::Http { .. } => {
                let transport =
                    StreamableHttpTransport::new(descriptor, credential, &self.client_config)?;
                let session =
                    McpSession::establish(&descriptor.name, transport, &self.client_config).await?;
                Ok(Box::new(session))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Replays scripted responses and records requests
    struct ScriptedTransport {
        responses: VecDeque<RpcResult<McpResponse>>,
        methods: Vec<String>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<RpcResult<Value>>) -> (Self, Arc<AtomicUsize>) {
            let shutdowns = Arc::new(AtomicUsize::new(0));
            let responses = responses
                .into_iter()
                .map(|r| r.map(|v| McpResponse::success(json!(0), v)))
                .collect();
            (
                Self {
                    responses,
                    methods: Vec::new(),
                    shutdowns: Arc::clone(&shutdowns),
                },
                shutdowns,
            )
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn request(&mut self, request: McpRequest) -> RpcResult<McpResponse> {
            self.methods.push(request.method);
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(RpcFailure::Transport("script exhausted".to_string())))
        }

        async fn notify(&mut self, notification: McpRequest) -> RpcResult<()> {
            self.methods.push(notification.method);
            Ok(())
        }

        async fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn init_result() -> RpcResult<Value> {
        Ok(json!({"protocolVersion": "2025-06-18", "serverInfo": {"name": "todo"}}))
    }

    #[tokio::test]
    async fn test_handshake_then_discover_and_invoke() {
        let (transport, _) = ScriptedTransport::new(vec![
            init_result(),
            Ok(json!({"tools": [{"name": "list_projects", "inputSchema": {"type": "object"}}]})),
            Ok(json!({"content": [{"type": "text", "text": "[\"Groceries\",\"Work\"]"}]})),
        ]);
        let mut session = McpSession::establish("todo", transport, &McpClientConfig::default())
            .await
            .unwrap();

        let tools = session.discover_operations().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "list_projects");

        let outcome = session.invoke("list_projects", json!({})).await.unwrap();
        assert_eq!(outcome, OperationOutcome::Success("[\"Groceries\",\"Work\"]".to_string()));

        assert_eq!(
            session.transport.methods,
            vec!["initialize", "notifications/initialized", "tools/list", "tools/call"]
        );
    }

    #[tokio::test]
    async fn test_discovery_follows_cursor() {
        let (transport, _) = ScriptedTransport::new(vec![
            init_result(),
            Ok(json!({"tools": [{"name": "a"}], "nextCursor": "page2"})),
            Ok(json!({"tools": [{"name": "b"}]})),
        ]);
        let mut session = McpSession::establish("todo", transport, &McpClientConfig::default())
            .await
            .unwrap();
        let names: Vec<_> = session
            .discover_operations()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_downstream_errors_are_data() {
        let (transport, _) = ScriptedTransport::new(vec![
            init_result(),
            Ok(json!({"content": [{"type": "text", "text": "no such project"}], "isError": true})),
            Err(RpcFailure::Remote(McpError::invalid_params("bad args"))),
            Err(RpcFailure::Timeout("30s".to_string())),
        ]);
        let mut session = McpSession::establish("todo", transport, &McpClientConfig::default())
            .await
            .unwrap();

        assert_eq!(
            session.invoke("get", json!({})).await.unwrap(),
            OperationOutcome::Failed("[Tool Error] no such project".to_string())
        );
        assert!(matches!(
            session.invoke("get", json!({})).await.unwrap(),
            OperationOutcome::Failed(msg) if msg.contains("bad args")
        ));
        assert!(matches!(
            session.invoke("get", json!({})).await.unwrap(),
            OperationOutcome::Failed(msg) if msg.contains("timed out")
        ));
    }

    #[tokio::test]
    async fn test_transport_loss_is_fatal() {
        let (transport, _) = ScriptedTransport::new(vec![
            init_result(),
            Err(RpcFailure::Transport("broken pipe".to_string())),
        ]);
        let mut session = McpSession::establish("todo", transport, &McpClientConfig::default())
            .await
            .unwrap();
        let err = session.invoke("get", json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_failed_handshake_shuts_transport_down() {
        let (transport, shutdowns) = ScriptedTransport::new(vec![Err(RpcFailure::Status {
            status: 401,
            body: String::new(),
        })]);
        let err = McpSession::establish("todo", transport, &McpClientConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Auth { .. }));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, shutdowns) = ScriptedTransport::new(vec![init_result()]);
        let mut session = McpSession::establish("todo", transport, &McpClientConfig::default())
            .await
            .unwrap();
        session.close().await;
        session.close().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(session.invoke("x", json!({})).await.is_err());
    }
}
