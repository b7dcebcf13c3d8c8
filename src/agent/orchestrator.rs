//! Invocation orchestrator
//!
//! Drives one instruction against one downstream server:
//!
//! ```text
//! INIT -> CONNECTING -> DISCOVERING -> THINKING <-> ACTING -> TERMINATING -> COMPLETED | FAILED
//! ```
//!
//! The connection opened in CONNECTING belongs to the run alone and is
//! closed in TERMINATING on every exit path, including cancellation and
//! panics inside the loop. Operations already applied downstream are not
//! compensated: each call is at most once per attempt.

use crate::agent::conversation::{ConversationState, ToolCall, ToolResultTurn};
use crate::agent::llm_client::{LlmClient, LlmRequest};
use crate::auth::CredentialProvider;
use crate::config::Config;
use crate::error::{AgentError, FailureKind, Result};
use crate::mcp::bridge::{Connector, McpConnection, OperationOutcome};
use crate::mcp::types::OperationSchema;
use crate::registry::{ServerDescriptor, ServerRegistry};
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Terminal outcome of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationResult {
    Completed { text: String },
    Failed { kind: FailureKind, message: String },
}

impl InvocationResult {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        InvocationResult::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, InvocationResult::Completed { .. })
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            InvocationResult::Completed { .. } => None,
            InvocationResult::Failed { kind, .. } => Some(*kind),
        }
    }
}

impl From<AgentError> for InvocationResult {
    fn from(error: AgentError) -> Self {
        InvocationResult::failed(error.kind(), error.message())
    }
}

impl fmt::Display for InvocationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationResult::Completed { text } => f.write_str(text),
            InvocationResult::Failed { kind, message } => write!(f, "{}: {}", kind, message),
        }
    }
}

/// Loop states; terminal outcomes are returned rather than stored
#[derive(Debug)]
enum RunState {
    Connecting,
    Discovering,
    Thinking,
    Acting(Vec<ToolCall>),
}

impl RunState {
    fn name(&self) -> &'static str {
        match self {
            RunState::Connecting => "CONNECTING",
            RunState::Discovering => "DISCOVERING",
            RunState::Thinking => "THINKING",
            RunState::Acting(_) => "ACTING",
        }
    }
}

/// Per-process loop settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model: String,
    pub max_tokens: u32,
    /// Ceiling on operation calls per run
    pub max_iterations: u32,
    pub system_prompt: Option<String>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_iterations: config.max_iterations(),
            system_prompt: config.system_prompt.clone(),
        }
    }
}

/// Runs instructions against registry servers; cheap to share across tasks
pub struct InvocationOrchestrator {
    registry: Arc<ServerRegistry>,
    credentials: Arc<CredentialProvider>,
    connector: Arc<dyn Connector>,
    llm: Arc<dyn LlmClient>,
    settings: OrchestratorSettings,
}

impl InvocationOrchestrator {
    pub fn new(
        registry: Arc<ServerRegistry>,
        credentials: Arc<CredentialProvider>,
        connector: Arc<dyn Connector>,
        llm: Arc<dyn LlmClient>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            credentials,
            connector,
            llm,
            settings,
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Run `instruction` against `server` until a final answer or a failure
    pub async fn invoke(
        &self,
        server: &str,
        instruction: &str,
        cancel: CancellationToken,
    ) -> InvocationResult {
        let Some(descriptor) = self.registry.lookup(server) else {
            return InvocationResult::failed(
                FailureKind::ConfigError,
                format!("Unknown server '{}'", server),
            );
        };
        info!(
            "[{}] Running instruction: {}",
            server,
            instruction.chars().take(100).collect::<String>()
        );

        let mut connection: Option<Box<dyn McpConnection>> = None;
        let run = AssertUnwindSafe(self.run(&descriptor, instruction, &cancel, &mut connection))
            .catch_unwind()
            .await;

        // TERMINATING
        if let Some(mut connection) = connection.take() {
            debug!("[{}] state TERMINATING: closing connection", server);
            connection.close().await;
        }

        let result = match run {
            Ok(Ok(text)) => InvocationResult::Completed { text },
            Ok(Err(e)) => InvocationResult::from(e),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "run aborted".to_string());
                error!("[{}] Run panicked: {}", server, message);
                InvocationResult::failed(FailureKind::UnexpectedFault, message)
            }
        };
        match &result {
            InvocationResult::Completed { .. } => info!("[{}] Run completed", server),
            InvocationResult::Failed { kind, message } => {
                warn!("[{}] Run failed: {}: {}", server, kind, message)
            }
        }
        result
    }

    async fn run(
        &self,
        descriptor: &ServerDescriptor,
        instruction: &str,
        cancel: &CancellationToken,
        connection: &mut Option<Box<dyn McpConnection>>,
    ) -> Result<String> {
        let name = descriptor.name.as_str();
        let system = self.system_prompt(descriptor);
        let mut conversation = ConversationState::new(instruction);
        let mut operations: Vec<OperationSchema> = Vec::new();
        let mut state = RunState::Connecting;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::cancelled(format!(
                    "Invocation of '{}' was cancelled",
                    name
                )));
            }
            debug!("[{}] state {}", name, state.name());

            state = match state {
                RunState::Connecting => {
                    let credential =
                        cancellable(cancel, name, self.credentials.obtain(descriptor)).await?;
                    // Awaited in full so an established session always reaches TERMINATING
                    *connection = Some(self.connector.open(descriptor, &credential).await?);
                    RunState::Discovering
                }
                RunState::Discovering => {
                    let live = connected(connection, name)?;
                    operations = cancellable(cancel, name, live.discover_operations()).await?;
                    info!("[{}] Loaded {} operation(s)", name, operations.len());
                    RunState::Thinking
                }
                RunState::Thinking => {
                    if conversation.iterations() >= self.settings.max_iterations {
                        return Err(AgentError::iteration_limit(format!(
                            "'{}' made {} operation call(s) without a final answer",
                            name,
                            conversation.iterations()
                        )));
                    }
                    let request = LlmRequest {
                        model: &self.settings.model,
                        max_tokens: self.settings.max_tokens,
                        system: &system,
                        turns: conversation.turns(),
                        tools: &operations,
                    };
                    let reply = cancellable(cancel, name, self.llm.next_turn(&request)).await?;
                    if reply.is_final() {
                        info!(
                            "[{}] Final answer after {} operation call(s)",
                            name,
                            conversation.iterations()
                        );
                        return Ok(reply.text.unwrap_or_default());
                    }
                    conversation.push_assistant(reply.text, reply.tool_calls.clone());
                    RunState::Acting(reply.tool_calls)
                }
                RunState::Acting(calls) => {
                    let live = connected(connection, name)?;
                    let mut results = Vec::with_capacity(calls.len());
                    for call in calls {
                        let (content, is_error) =
                            self.act(name, live.as_mut(), &operations, &mut conversation, &call)
                                .await?;
                        results.push(ToolResultTurn {
                            call_id: call.id,
                            content,
                            is_error,
                        });
                    }
                    conversation.push_tool_results(results);
                    RunState::Thinking
                }
            };
        }
    }

    /// Execute one requested call. Only a lost transport is an `Err`.
    async fn act(
        &self,
        name: &str,
        connection: &mut dyn McpConnection,
        operations: &[OperationSchema],
        conversation: &mut ConversationState,
        call: &ToolCall,
    ) -> Result<(String, bool)> {
        if conversation.iterations() >= self.settings.max_iterations {
            return Ok((
                format!(
                    "Iteration limit reached ({}); '{}' was not called",
                    self.settings.max_iterations, call.name
                ),
                true,
            ));
        }
        conversation.record_iteration();

        if !operations.iter().any(|op| op.name == call.name) {
            warn!("[{}] Model requested unknown operation '{}'", name, call.name);
            return Ok((
                format!(
                    "[Error calling tool {}]: unknown operation; available: {}",
                    call.name,
                    operations
                        .iter()
                        .map(|op| op.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                true,
            ));
        }

        info!("[{}] Calling operation: {}", name, call.name);
        debug!("[{}] Operation input: {}", name, call.arguments);
        let outcome = connection.invoke(&call.name, call.arguments.clone()).await?;
        Ok(match outcome {
            OperationOutcome::Success(text) => {
                debug!("[{}] Operation result: {}", name, preview(&text));
                (text, false)
            }
            OperationOutcome::Failed(text) => {
                warn!("[{}] Operation '{}' failed: {}", name, call.name, preview(&text));
                (text, true)
            }
        })
    }

    fn system_prompt(&self, descriptor: &ServerDescriptor) -> String {
        let mut prompt = format!(
            "You operate the '{}' service through its tools.",
            descriptor.name
        );
        if !descriptor.description.is_empty() {
            prompt.push(' ');
            prompt.push_str(&descriptor.description);
        }
        prompt.push_str(
            "\nCarry out the user's instruction with the tools, then reply with a concise final answer.",
        );
        if let Some(extra) = self.settings.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            prompt.push_str("\n\n");
            prompt.push_str(extra);
        }
        prompt
    }
}

fn connected<'a>(
    connection: &'a mut Option<Box<dyn McpConnection>>,
    name: &str,
) -> Result<&'a mut Box<dyn McpConnection>> {
    connection
        .as_mut()
        .ok_or_else(|| AgentError::connection(format!("No open connection to '{}'", name)))
}

/// Await `future` unless the run is cancelled first
async fn cancellable<T>(
    cancel: &CancellationToken,
    name: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::cancelled(format!(
            "Invocation of '{}' was cancelled",
            name
        ))),
        result = future => result,
    }
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 500;
    if text.chars().count() > LIMIT {
        format!("{}...", text.chars().take(LIMIT).collect::<String>())
    } else {
        text.to_string()
    }
}
