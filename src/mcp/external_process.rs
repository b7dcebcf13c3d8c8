//! Stdio transport for downstream MCP servers
//!
//! Spawns the configured command and exchanges newline-delimited JSON-RPC
//! messages over its stdin/stdout. Stderr lines are forwarded to the log.

use crate::config::McpClientConfig;
use crate::error::{AgentError, Result};
use crate::mcp::bridge::{RpcFailure, RpcResult, RpcTransport};
use crate::mcp::errors::McpError;
use crate::mcp::types::{request_key, IncomingMessage, McpRequest, McpResponse};
use crate::registry::{LaunchSpec, ServerDescriptor};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<McpResponse>>>>;

/// Grace period after closing stdin before the child is killed
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// A spawned MCP server process
pub struct StdioTransport {
    /// Server name from configuration
    name: String,
    /// The spawned child process
    process: Option<Child>,
    /// Channel for sending JSON-RPC messages to the process
    stdin_sender: Option<mpsc::UnboundedSender<String>>,
    /// Pending requests waiting for responses
    pending_requests: PendingRequests,
    request_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawn the server process and start the I/O tasks
    pub fn spawn(descriptor: &ServerDescriptor, client_config: &McpClientConfig) -> Result<Self> {
        let LaunchSpec::Stdio {
            command,
            args,
            env,
            cwd,
        } = &descriptor.launch
        else {
            return Err(AgentError::config(format!(
                "Server '{}' is not a stdio server",
                descriptor.name
            )));
        };
        let name = descriptor.name.clone();
        info!("Starting MCP server '{}': {} {}", name, command, args.join(" "));

        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.envs(env);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::connection(format!("Failed to spawn MCP server '{}': {}", name, e))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            AgentError::connection(format!("Failed to get stdin for MCP server '{}'", name))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AgentError::connection(format!("Failed to get stdout for MCP server '{}'", name))
        })?;
        let stderr = child.stderr.take();

        let pending_requests: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();

        let mut tasks = vec![
            tokio::spawn(write_stdin(name.clone(), stdin, stdin_rx)),
            tokio::spawn(read_stdout(
                name.clone(),
                stdout,
                Arc::clone(&pending_requests),
                stdin_tx.downgrade(),
            )),
        ];
        if let Some(stderr) = stderr {
            let server_name = name.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] stderr: {}", server_name, line);
                }
            }));
        }

        Ok(Self {
            name,
            process: Some(child),
            stdin_sender: Some(stdin_tx),
            pending_requests,
            request_timeout: Duration::from_secs(client_config.request_timeout_secs),
            tasks,
        })
    }

    fn send_line(&self, message: &McpRequest) -> RpcResult<()> {
        let line = serde_json::to_string(message)
            .map_err(|e| RpcFailure::Transport(format!("Failed to serialize request: {}", e)))?;
        match &self.stdin_sender {
            Some(sender) => sender.send(line).map_err(|_| {
                RpcFailure::Transport(format!("MCP server '{}' stdin is closed", self.name))
            }),
            None => Err(RpcFailure::Transport(format!(
                "MCP server '{}' is not running",
                self.name
            ))),
        }
    }
}

async fn write_stdin(
    server_name: String,
    mut stdin: tokio::process::ChildStdin,
    mut receiver: mpsc::UnboundedReceiver<String>,
) {
    while let Some(message) = receiver.recv().await {
        if let Err(e) = stdin.write_all(message.as_bytes()).await {
            error!("Failed to write to MCP server '{}' stdin: {}", server_name, e);
            break;
        }
        if let Err(e) = stdin.write_all(b"\n").await {
            error!("Failed to write newline to MCP server '{}' stdin: {}", server_name, e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!("Failed to flush MCP server '{}' stdin: {}", server_name, e);
            break;
        }
    }
}

async fn read_stdout(
    server_name: String,
    stdout: tokio::process::ChildStdout,
    pending_requests: PendingRequests,
    replies: mpsc::WeakUnboundedSender<String>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!("MCP server '{}' stdout: {}", server_name, line);

        let message = serde_json::from_str::<Value>(&line)
            .map_err(|e| e.to_string())
            .and_then(|value| IncomingMessage::parse(value).map_err(|e| e.to_string()));
        match message {
            Ok(IncomingMessage::Response(response)) => {
                let key = request_key(&response.id);
                let sender = pending_requests.lock().await.remove(&key);
                match sender {
                    Some(sender) => {
                        if sender.send(response).is_err() {
                            debug!("Response {} from '{}' arrived after its waiter gave up", key, server_name);
                        }
                    }
                    None => warn!("Unmatched response id {} from MCP server '{}'", key, server_name),
                }
            }
            Ok(IncomingMessage::Request(request)) => {
                if let Some(reply) = answer_server_request(&server_name, request) {
                    match (serde_json::to_string(&reply), replies.upgrade()) {
                        (Ok(line), Some(sender)) => {
                            let _ = sender.send(line);
                        }
                        _ => debug!("Dropping reply to '{}': stdin is closed", server_name),
                    }
                }
            }
            Err(e) => {
                warn!("Failed to parse JSON-RPC message from MCP server '{}': {} (line: {})", server_name, e, line);
            }
        }
    }

    warn!("MCP server '{}' stdout reader ended", server_name);
    // Dropping the senders wakes every waiter with a closed-channel error
    pending_requests.lock().await.clear();
}

/// Answer server-initiated requests; notifications get no reply
fn answer_server_request(server_name: &str, request: McpRequest) -> Option<McpResponse> {
    let id = request.id?;
    match request.method.as_str() {
        "ping" => Some(McpResponse::success(id, json!({}))),
        other => {
            debug!("Declining server request '{}' from '{}'", other, server_name);
            Some(McpResponse::error(id, McpError::method_not_found(other)))
        }
    }
}

#[async_trait]
impl RpcTransport for StdioTransport {
    async fn request(&mut self, request: McpRequest) -> RpcResult<McpResponse> {
        let key = request
            .id
            .as_ref()
            .map(request_key)
            .ok_or_else(|| RpcFailure::Transport("request without id".to_string()))?;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending_requests
            .lock()
            .await
            .insert(key.clone(), response_tx);

        if let Err(failure) = self.send_line(&request) {
            self.pending_requests.lock().await.remove(&key);
            return Err(failure);
        }

        match timeout(self.request_timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RpcFailure::Transport(format!(
                "MCP server '{}' exited before responding to {}",
                self.name, request.method
            ))),
            Err(_) => {
                self.pending_requests.lock().await.remove(&key);
                Err(RpcFailure::Timeout(format!(
                    "{} on '{}' after {}s",
                    request.method,
                    self.name,
                    self.request_timeout.as_secs()
                )))
            }
        }
    }

    async fn notify(&mut self, notification: McpRequest) -> RpcResult<()> {
        self.send_line(&notification)
    }

    async fn shutdown(&mut self) {
        info!("Stopping MCP server '{}'", self.name);
        // Closing stdin asks the server to exit
        self.stdin_sender = None;

        if let Some(mut process) = self.process.take() {
            match timeout(EXIT_GRACE, process.wait()).await {
                Ok(Ok(status)) => debug!("MCP server '{}' exited with status: {}", self.name, status),
                Ok(Err(e)) => error!("Error waiting for MCP server '{}' to exit: {}", self.name, e),
                Err(_) => {
                    if let Err(e) = process.kill().await {
                        warn!("Failed to kill MCP server '{}': {}", self.name, e);
                    }
                    match timeout(Duration::from_secs(5), process.wait()).await {
                        Ok(Ok(status)) => debug!("MCP server '{}' killed ({})", self.name, status),
                        Ok(Err(e)) => error!("Error waiting for MCP server '{}' to exit: {}", self.name, e),
                        Err(_) => warn!("MCP server '{}' did not exit within timeout", self.name),
                    }
                }
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.pending_requests.lock().await.clear();
    }
}
