//! Streamable HTTP transport for downstream MCP servers
//!
//! Every JSON-RPC message is POSTed to the server URL. Responses arrive
//! either as a single JSON body or as an SSE stream whose `data:` events
//! carry JSON-RPC messages. The session id returned with `initialize` is
//! echoed on later requests and the session is ended with DELETE.

use crate::auth::Credential;
use crate::config::McpClientConfig;
use crate::error::{AgentError, Result};
use crate::mcp::bridge::{RpcFailure, RpcResult, RpcTransport};
use crate::mcp::types::{request_key, IncomingMessage, McpRequest, McpResponse};
use crate::registry::{AuthMode, LaunchSpec, ServerDescriptor};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// HTTP session with one downstream MCP server
pub struct StreamableHttpTransport {
    /// Server name for identification
    server_name: String,
    http_client: Client,
    url: Url,
    /// Configured headers plus the credential header
    headers: HeaderMap,
    session_id: Option<String>,
    protocol_version: Option<String>,
}

impl StreamableHttpTransport {
    pub fn new(
        descriptor: &ServerDescriptor,
        credential: &Credential,
        client_config: &McpClientConfig,
    ) -> Result<Self> {
        let LaunchSpec::Http { url, headers } = &descriptor.launch else {
            return Err(AgentError::config(format!(
                "Server '{}' is not an http server",
                descriptor.name
            )));
        };

        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(client_config.connect_timeout_secs))
            .timeout(Duration::from_secs(client_config.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AgentError::connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            server_name: descriptor.name.clone(),
            http_client,
            url: url.clone(),
            headers: build_headers(&descriptor.name, headers, &descriptor.auth, credential)?,
            session_id: None,
            protocol_version: None,
        })
    }

    async fn post(&mut self, message: &McpRequest) -> RpcResult<Response> {
        let mut request = self
            .http_client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .header(CONTENT_TYPE, "application/json")
            .json(message);
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }
        if let Some(version) = &self.protocol_version {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RpcFailure::Timeout(format!("{} on '{}': {}", message.method, self.server_name, e))
            } else {
                RpcFailure::Transport(format!("POST to '{}' failed: {}", self.server_name, e))
            }
        })?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if self.session_id.as_deref() != Some(session_id) {
                debug!("Server '{}' assigned session {}", self.server_name, session_id);
                self.session_id = Some(session_id.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && self.session_id.is_some() {
            return Err(RpcFailure::Transport(format!(
                "Session with '{}' expired",
                self.server_name
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RpcFailure::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn read_response(&self, response: Response, expected_id: &Value) -> RpcResult<McpResponse> {
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                RpcFailure::Timeout(format!("reading response from '{}': {}", self.server_name, e))
            } else {
                RpcFailure::Transport(format!("Failed to read response from '{}': {}", self.server_name, e))
            }
        })?;

        if is_event_stream {
            let expected = request_key(expected_id);
            for data in sse_data_events(&body) {
                match serde_json::from_str::<Value>(&data).map(IncomingMessage::parse) {
                    Ok(Ok(IncomingMessage::Response(response))) if request_key(&response.id) == expected => {
                        return Ok(response)
                    }
                    Ok(Ok(IncomingMessage::Request(request))) => {
                        debug!("Ignoring '{}' sent by '{}' on a response stream", request.method, self.server_name)
                    }
                    Ok(Ok(IncomingMessage::Response(_))) => {}
                    Ok(Err(e)) | Err(e) => {
                        warn!("Skipping malformed SSE event from '{}': {}", self.server_name, e)
                    }
                }
            }
            Err(RpcFailure::Transport(format!(
                "Event stream from '{}' ended without a response",
                self.server_name
            )))
        } else {
            serde_json::from_str::<McpResponse>(&body).map_err(|e| {
                RpcFailure::Transport(format!("Invalid JSON-RPC response from '{}': {}", self.server_name, e))
            })
        }
    }
}

/// Configured headers plus the credential header for the auth mode
fn build_headers(
    server_name: &str,
    configured: &std::collections::HashMap<String, String>,
    auth: &AuthMode,
    credential: &Credential,
) -> Result<HeaderMap> {
    let invalid = |e: &dyn std::fmt::Display| {
        AgentError::config(format!("Server '{}': invalid header: {}", server_name, e))
    };

    let mut headers = HeaderMap::new();
    for (name, value) in configured {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(&e))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(&e))?;
        headers.insert(name, value);
    }

    match auth {
        AuthMode::None => {}
        AuthMode::StaticHeader { name, .. } => {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(&e))?;
            let mut value =
                HeaderValue::from_str(credential.access_token.expose_secret()).map_err(|e| invalid(&e))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }
        AuthMode::OAuth(_) => {
            let mut value = HeaderValue::from_str(&format!(
                "Bearer {}",
                credential.access_token.expose_secret()
            ))
            .map_err(|e| invalid(&e))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
    }
    Ok(headers)
}

/// Extract the payload of each SSE event (multi-line `data:` fields are joined)
pub fn sse_data_events(body: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in body.lines() {
        if line.is_empty() {
            if !current.is_empty() {
                events.push(current.join("\n"));
                current.clear();
            }
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            current.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }
    if !current.is_empty() {
        events.push(current.join("\n"));
    }
    events
}

#[async_trait]
impl RpcTransport for StreamableHttpTransport {
    async fn request(&mut self, request: McpRequest) -> RpcResult<McpResponse> {
        debug!("Sending '{}' to '{}'", request.method, self.server_name);
        let expected_id = request.id.clone().unwrap_or(Value::Null);
        let response = self.post(&request).await?;
        self.read_response(response, &expected_id).await
    }

    async fn notify(&mut self, notification: McpRequest) -> RpcResult<()> {
        self.post(&notification).await.map(|_| ())
    }

    fn set_protocol_version(&mut self, version: &str) {
        self.protocol_version = Some(version.to_string());
    }

    async fn shutdown(&mut self) {
        let Some(session_id) = self.session_id.take() else {
            return;
        };
        let result = self
            .http_client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_HEADER, &session_id)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!("Closed session {} with '{}'", session_id, self.server_name)
            }
            Ok(response) => debug!(
                "Session DELETE for '{}' returned {}",
                self.server_name,
                response.status()
            ),
            Err(e) => warn!("Failed to close session with '{}': {}", self.server_name, e),
        }
    }
}
