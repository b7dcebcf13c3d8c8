//! OpenAI Chat Completions backend, also used for OpenAI-compatible servers such as Ollama

use crate::agent::conversation::{ToolCall, Turn};
use crate::agent::llm_client::{split_model, LlmClient, LlmReply, LlmRequest};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    id: String,
    function: ChatFunction,
}

#[derive(Debug, Deserialize)]
struct ChatFunction {
    name: String,
    /// JSON-encoded arguments
    #[serde(default)]
    arguments: String,
}

pub struct OpenAiClient {
    http_client: Client,
    api_key: Option<String>,
    api_base: String,
}

impl OpenAiClient {
    pub fn new(api_key: Option<String>, api_base: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            api_key,
            api_base: api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn convert_turns(system: &str, turns: &[Turn]) -> Vec<Value> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        if !system.is_empty() {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for turn in turns {
            match turn {
                Turn::User(text) => messages.push(json!({ "role": "user", "content": text })),
                Turn::Assistant { text, calls } => {
                    let mut message = json!({ "role": "assistant", "content": text });
                    if !calls.is_empty() {
                        message["tool_calls"] = calls
                            .iter()
                            .map(|call| {
                                json!({
                                    "id": call.id,
                                    "type": "function",
                                    "function": {
                                        "name": call.name,
                                        "arguments": call.arguments.to_string()
                                    }
                                })
                            })
                            .collect();
                    }
                    messages.push(message);
                }
                Turn::ToolResults(results) => {
                    for result in results {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": result.call_id,
                            "content": result.content
                        }));
                    }
                }
            }
        }
        messages
    }

    fn parse_arguments(call: &ChatFunction) -> Value {
        if call.arguments.trim().is_empty() {
            return json!({});
        }
        match serde_json::from_str(&call.arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                // Forwarded as-is so the downstream rejection reaches the model
                warn!("Tool call '{}' has non-JSON arguments: {}", call.name, e);
                Value::String(call.arguments.clone())
            }
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn next_turn(&self, request: &LlmRequest<'_>) -> Result<LlmReply> {
        let (_, model) = split_model(request.model)?;
        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "messages": Self::convert_turns(request.system, request.turns),
        });
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description.clone().unwrap_or_default(),
                            "parameters": tool.input_schema
                        }
                    })
                })
                .collect();
        }

        let mut http_request = self
            .http_client
            .post(format!("{}/chat/completions", self.api_base))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key);
        }
        let response = http_request
            .send()
            .await
            .map_err(|e| AgentError::llm(format!("OpenAI API request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::llm(format!(
                "OpenAI API error {}: {}",
                status.as_u16(),
                text
            )));
        }

        let response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::llm(format!("Failed to parse OpenAI response: {}", e)))?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::llm("OpenAI response has no choices"))?;
        debug!(
            "OpenAI reply: finish_reason={:?}, {} tool call(s)",
            choice.finish_reason,
            choice.message.tool_calls.as_ref().map_or(0, Vec::len)
        );

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .iter()
            .map(|call| ToolCall {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: Self::parse_arguments(&call.function),
            })
            .collect();
        Ok(LlmReply {
            text: choice.message.content.filter(|text| !text.is_empty()),
            tool_calls,
        })
    }
}
