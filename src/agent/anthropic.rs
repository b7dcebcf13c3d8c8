//! Anthropic Messages API backend

use crate::agent::conversation::{ToolCall, Turn};
use crate::agent::llm_client::{split_model, LlmClient, LlmReply, LlmRequest};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

pub struct AnthropicClient {
    http_client: Client,
    api_key: String,
    api_base: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, api_base: Option<String>, timeout: Duration) -> Result<Self> {
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

    fn convert_turns(turns: &[Turn]) -> Vec<Value> {
        turns
            .iter()
            .map(|turn| match turn {
                Turn::User(text) => json!({ "role": "user", "content": text }),
                Turn::Assistant { text, calls } => {
                    let mut blocks = Vec::new();
                    if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                    for call in calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.arguments
                        }));
                    }
                    json!({ "role": "assistant", "content": blocks })
                }
                Turn::ToolResults(results) => {
                    let blocks: Vec<Value> = results
                        .iter()
                        .map(|result| {
                            json!({
                                "type": "tool_result",
                                "tool_use_id": result.call_id,
                                "content": result.content,
                                "is_error": result.is_error
                            })
                        })
                        .collect();
                    json!({ "role": "user", "content": blocks })
                }
            })
            .collect()
    }

    fn parse_response(response: MessagesResponse) -> LlmReply {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                ContentBlock::Text { text } => text_parts.push(text),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: if input.is_null() { json!({}) } else { input },
                }),
                ContentBlock::Other => {}
            }
        }
        debug!(
            "Anthropic reply: stop_reason={:?}, {} tool call(s)",
            response.stop_reason,
            tool_calls.len()
        );
        LlmReply {
            text: if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.join("\n"))
            },
            tool_calls,
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn next_turn(&self, request: &LlmRequest<'_>) -> Result<LlmReply> {
        let (_, model) = split_model(request.model)?;
        let body = MessagesRequest {
            model,
            max_tokens: request.max_tokens,
            system: request.system,
            messages: Self::convert_turns(request.turns),
            tools: request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description.clone().unwrap_or_default(),
                        "input_schema": tool.input_schema
                    })
                })
                .collect(),
        };

        let response = self
            .http_client
            .post(format!("{}/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::llm(format!("Anthropic API request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ApiErrorResponse>(&text) {
                Ok(error) => format!("{} ({})", error.error.message, error.error.error_type),
                Err(_) => text,
            };
            return Err(AgentError::llm(format!(
                "Anthropic API error {}: {}",
                status.as_u16(),
                message
            )));
        }

        let response: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AgentError::llm(format!("Failed to parse Anthropic response: {}", e)))?;
        Ok(Self::parse_response(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::conversation::ToolResultTurn;
    use crate::mcp::types::OperationSchema;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> AnthropicClient {
        AnthropicClient::new("test-key".to_string(), Some(server.uri()), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_tool_results_are_user_blocks() {
        let turns = vec![
            Turn::User("list projects".to_string()),
            Turn::Assistant {
                text: Some("Looking".to_string()),
                calls: vec![ToolCall {
                    id: "toolu_1".to_string(),
                    name: "list_projects".to_string(),
                    arguments: json!({}),
                }],
            },
            Turn::ToolResults(vec![ToolResultTurn {
                call_id: "toolu_1".to_string(),
                content: "boom".to_string(),
                is_error: true,
            }]),
        ];
        let messages = AnthropicClient::convert_turns(&turns);
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(messages[2]["content"][0]["is_error"], true);
    }

    #[tokio::test]
    async fn test_tool_use_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [
                    {"type": "text", "text": "Let me check."},
                    {"type": "tool_use", "id": "toolu_1", "name": "list_projects", "input": {}}
                ],
                "stop_reason": "tool_use"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let turns = vec![Turn::User("list projects".to_string())];
        let tools = vec![OperationSchema {
            name: "list_projects".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }];
        let reply = client(&server)
            .next_turn(&LlmRequest {
                model: "anthropic/claude-sonnet-4-20250514",
                max_tokens: 1024,
                system: "",
                turns: &turns,
                tools: &tools,
            })
            .await
            .unwrap();

        assert_eq!(reply.text.as_deref(), Some("Let me check."));
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "list_projects");
        assert!(!reply.is_final());
    }

    #[tokio::test]
    async fn test_api_error_is_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_json(json!({
                "type": "error",
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            })))
            .mount(&server)
            .await;

        let turns = vec![Turn::User("hi".to_string())];
        let err = client(&server)
            .next_turn(&LlmRequest {
                model: "claude-sonnet-4-20250514",
                max_tokens: 16,
                system: "",
                turns: &turns,
                tools: &[],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm { .. }));
        assert!(err.message().contains("Overloaded"));
    }
}
