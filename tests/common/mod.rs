//! Shared test doubles for the integration tests
#![allow(dead_code)]

use agent_mcp::agent::{
    InvocationOrchestrator, LlmClient, LlmReply, LlmRequest, OrchestratorSettings, ToolCall,
};
use agent_mcp::auth::{BrowserLauncher, Credential, CredentialProvider, FileTokenStorage};
use agent_mcp::config::{Config, OAuthFlowConfig};
use agent_mcp::error::{AgentError, Result};
use agent_mcp::mcp::{Connector, McpConnection, OperationOutcome, OperationSchema};
use agent_mcp::registry::{ServerDescriptor, ServerRegistry};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn registry_from_yaml(yaml: &str) -> Arc<ServerRegistry> {
    let config = Config::from_yaml_str(yaml).unwrap();
    Arc::new(ServerRegistry::from_config(&config).unwrap())
}

pub fn todo_registry() -> Arc<ServerRegistry> {
    registry_from_yaml(
        r#"
servers:
  todo:
    description: Manage todo projects and tasks
    command: todo-mcp
"#,
    )
}

pub fn settings(max_iterations: u32) -> OrchestratorSettings {
    OrchestratorSettings {
        model: "anthropic/claude-sonnet-4-20250514".to_string(),
        max_tokens: 1024,
        max_iterations,
        system_prompt: None,
    }
}

pub fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

/// What a [`ScriptedLlm`] saw on each call
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub turn_count: usize,
    pub tool_names: Vec<String>,
    pub last_turn: String,
}

/// Replays scripted replies; repeats the last reply once the script runs out
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<LlmReply>>>,
    repeat: Option<LlmReply>,
    pub seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<LlmReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            repeat: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Every call asks for `reply` again
    pub fn always(reply: LlmReply) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            repeat: Some(reply),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::from(vec![Err(AgentError::llm(message))])),
            repeat: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn next_turn(&self, request: &LlmRequest<'_>) -> Result<LlmReply> {
        self.seen.lock().unwrap().push(SeenRequest {
            turn_count: request.turns.len(),
            tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
            last_turn: format!("{:?}", request.turns.last()),
        });
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        match &self.repeat {
            Some(reply) => Ok(reply.clone()),
            None => Err(AgentError::llm("script exhausted")),
        }
    }
}

/// Never answers; only cancellation ends a run using it
pub struct StalledLlm;

#[async_trait]
impl LlmClient for StalledLlm {
    async fn next_turn(&self, _request: &LlmRequest<'_>) -> Result<LlmReply> {
        std::future::pending().await
    }
}

/// How a [`FakeConnection`] answers `invoke`
#[derive(Clone)]
pub enum InvokeBehavior {
    Reply(OperationOutcome),
    /// Fail with a broken transport
    Disconnect,
    Panic,
}

/// Counters shared between a [`FakeConnector`] and the connections it opens
#[derive(Default)]
pub struct BridgeCounters {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub invokes: AtomicUsize,
    pub invoked: Mutex<Vec<(String, Value)>>,
}

impl BridgeCounters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn invokes(&self) -> usize {
        self.invokes.load(Ordering::SeqCst)
    }
}

pub struct FakeConnector {
    pub counters: Arc<BridgeCounters>,
    operations: Vec<OperationSchema>,
    behavior: Arc<Mutex<VecDeque<InvokeBehavior>>>,
    default_behavior: InvokeBehavior,
    fail_open: Option<fn() -> AgentError>,
    fail_discovery: bool,
}

impl FakeConnector {
    pub fn new(operation_names: &[&str]) -> Self {
        Self {
            counters: Arc::new(BridgeCounters::default()),
            operations: operation_names
                .iter()
                .map(|name| OperationSchema {
                    name: name.to_string(),
                    description: Some(format!("{} operation", name)),
                    input_schema: json!({"type": "object", "properties": {}}),
                })
                .collect(),
            behavior: Arc::new(Mutex::new(VecDeque::new())),
            default_behavior: InvokeBehavior::Reply(OperationOutcome::Success("ok".to_string())),
            fail_open: None,
            fail_discovery: false,
        }
    }

    /// Scripted answers for successive `invoke` calls, then the default
    pub fn with_invocations(self, script: Vec<InvokeBehavior>) -> Self {
        *self.behavior.lock().unwrap() = script.into();
        self
    }

    pub fn with_default(mut self, behavior: InvokeBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    pub fn failing_open(mut self, error: fn() -> AgentError) -> Self {
        self.fail_open = Some(error);
        self
    }

    pub fn failing_discovery(mut self) -> Self {
        self.fail_discovery = true;
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        _descriptor: &ServerDescriptor,
        _credential: &Credential,
    ) -> Result<Box<dyn McpConnection>> {
        if let Some(error) = self.fail_open {
            return Err(error());
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            counters: Arc::clone(&self.counters),
            operations: self.operations.clone(),
            behavior: Arc::clone(&self.behavior),
            default_behavior: self.default_behavior.clone(),
            fail_discovery: self.fail_discovery,
            closed: false,
        }))
    }
}

pub struct FakeConnection {
    counters: Arc<BridgeCounters>,
    operations: Vec<OperationSchema>,
    behavior: Arc<Mutex<VecDeque<InvokeBehavior>>>,
    default_behavior: InvokeBehavior,
    fail_discovery: bool,
    closed: bool,
}

#[async_trait]
impl McpConnection for FakeConnection {
    async fn discover_operations(&mut self) -> Result<Vec<OperationSchema>> {
        if self.fail_discovery {
            return Err(AgentError::connection("tools/list failed"));
        }
        Ok(self.operations.clone())
    }

    async fn invoke(&mut self, name: &str, arguments: Value) -> Result<OperationOutcome> {
        self.counters.invokes.fetch_add(1, Ordering::SeqCst);
        self.counters
            .invoked
            .lock()
            .unwrap()
            .push((name.to_string(), arguments));
        let behavior = self
            .behavior
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.clone());
        match behavior {
            InvokeBehavior::Reply(outcome) => Ok(outcome),
            InvokeBehavior::Disconnect => Err(AgentError::connection("broken pipe")),
            InvokeBehavior::Panic => panic!("injected fault in {}", name),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Completes the browser step by hitting the redirect URI, like a user would
pub struct RedirectingBrowser {
    /// Query appended to the redirect; `{state}` is replaced with the request's state.
    /// `None` leaves the browser tab open without ever redirecting.
    query: Option<String>,
    delay: Duration,
    pub opened: AtomicUsize,
    pub redirect_uris: Mutex<Vec<String>>,
}

impl RedirectingBrowser {
    pub fn approving(code: &str) -> Self {
        Self::with_query(format!("code={}&state={{state}}", code))
    }

    pub fn denying(error: &str) -> Self {
        Self::with_query(format!("error={}&error_description=user+denied&state={{state}}", error))
    }

    /// Records the redirect URI but never calls it
    pub fn ignoring() -> Self {
        Self::build(None)
    }

    pub fn with_query(query: String) -> Self {
        Self::build(Some(query))
    }

    fn build(query: Option<String>) -> Self {
        Self {
            query,
            delay: Duration::from_millis(50),
            opened: AtomicUsize::new(0),
            redirect_uris: Mutex::new(Vec::new()),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for RedirectingBrowser {
    async fn open(&self, url: &str) -> Result<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let url = url::Url::parse(url)?;
        let param = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };
        let redirect_uri = param("redirect_uri");
        let state = param("state");
        self.redirect_uris.lock().unwrap().push(redirect_uri.clone());

        let Some(query) = &self.query else {
            return Ok(());
        };
        let target = format!("{}?{}", redirect_uri, query.replace("{state}", &state));
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = reqwest::get(&target).await;
        });
        Ok(())
    }
}

pub fn credential_provider(
    dir: &std::path::Path,
    browser: Arc<dyn BrowserLauncher>,
) -> Arc<CredentialProvider> {
    credential_provider_with_timeout(dir, browser, 10)
}

pub fn credential_provider_with_timeout(
    dir: &std::path::Path,
    browser: Arc<dyn BrowserLauncher>,
    callback_timeout_secs: u64,
) -> Arc<CredentialProvider> {
    let flow = OAuthFlowConfig {
        callback_timeout_secs,
        refresh_skew_secs: 60,
    };
    Arc::new(CredentialProvider::new(FileTokenStorage::new(dir), &flow, browser).unwrap())
}

pub fn orchestrator(
    registry: Arc<ServerRegistry>,
    credentials: Arc<CredentialProvider>,
    connector: Arc<dyn Connector>,
    llm: Arc<dyn LlmClient>,
    max_iterations: u32,
) -> InvocationOrchestrator {
    InvocationOrchestrator::new(registry, credentials, connector, llm, settings(max_iterations))
}
