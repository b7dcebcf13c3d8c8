//! Sub-agent loop: one LLM-driven run per instruction against one downstream server

pub mod anthropic;
pub mod conversation;
pub mod llm_client;
pub mod openai;
pub mod orchestrator;

pub use anthropic::AnthropicClient;
pub use conversation::{ConversationState, ToolCall, ToolResultTurn, Turn};
pub use llm_client::{build_llm_client, split_model, LlmClient, LlmProvider, LlmReply, LlmRequest};
pub use openai::OpenAiClient;
pub use orchestrator::{InvocationOrchestrator, InvocationResult, OrchestratorSettings};
