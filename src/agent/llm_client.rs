//! LLM client seam used by the orchestrator
//!
//! The orchestrator sees the model as a function from the conversation and
//! the discovered operations to the next reply. Providers translate the
//! neutral [`Turn`] list into their own wire format.

use crate::agent::anthropic::AnthropicClient;
use crate::agent::conversation::{ToolCall, Turn};
use crate::agent::openai::OpenAiClient;
use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::mcp::types::OperationSchema;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything a provider needs for one completion
#[derive(Debug, Clone, Copy)]
pub struct LlmRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub system: &'a str,
    pub turns: &'a [Turn],
    pub tools: &'a [OperationSchema],
}

/// The model's next move: calls to make, or a final answer when `tool_calls` is empty
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmReply {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl LlmReply {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls,
        }
    }

    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn next_turn(&self, request: &LlmRequest<'_>) -> Result<LlmReply>;
}

/// Supported LLM backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Anthropic,
    OpenAi,
}

impl LlmProvider {
    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::OpenAi => "OPENAI_API_KEY",
        }
    }
}

/// Split `provider/model` into the backend and the bare model name.
/// A name without a known provider prefix is an Anthropic model.
pub fn split_model(model: &str) -> Result<(LlmProvider, &str)> {
    match model.split_once('/') {
        Some(("anthropic", name)) => Ok((LlmProvider::Anthropic, name)),
        Some(("openai", name)) | Some(("ollama", name)) => Ok((LlmProvider::OpenAi, name)),
        Some((provider, _)) => Err(AgentError::config(format!(
            "Unsupported LLM provider: {}",
            provider
        ))),
        None => Ok((LlmProvider::Anthropic, model)),
    }
}

/// Build the client selected by `config.model`
pub fn build_llm_client(config: &Config) -> Result<Arc<dyn LlmClient>> {
    let (provider, _) = split_model(&config.model)?;
    let key_env = config
        .llm
        .api_key_env
        .clone()
        .unwrap_or_else(|| provider.default_api_key_env().to_string());
    let api_key = std::env::var(&key_env).ok().filter(|key| !key.is_empty());
    let timeout = Duration::from_secs(config.llm.timeout_secs);
    info!("Using {:?} LLM backend for model {}", provider, config.model);

    match provider {
        LlmProvider::Anthropic => {
            let api_key = api_key.ok_or_else(|| {
                AgentError::config(format!("Environment variable {} is not set", key_env))
            })?;
            Ok(Arc::new(AnthropicClient::new(
                api_key,
                config.llm.base_url.clone(),
                timeout,
            )?))
        }
        // Local OpenAI-compatible servers run without a key
        LlmProvider::OpenAi => Ok(Arc::new(OpenAiClient::new(
            api_key,
            config.llm.base_url.clone(),
            timeout,
        )?)),
    }
}
