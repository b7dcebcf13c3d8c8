//! Provider-neutral conversation record for one orchestrator run

use serde_json::Value;

/// An operation call requested by the LLM
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back with the result
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Outcome of one requested call as shown to the LLM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResultTurn {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    User(String),
    Assistant {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
    ToolResults(Vec<ToolResultTurn>),
}

/// Ordered turns plus the number of operation calls made so far
#[derive(Debug, Clone)]
pub struct ConversationState {
    turns: Vec<Turn>,
    iterations: u32,
}

impl ConversationState {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::User(instruction.into())],
            iterations: 0,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Count one operation call against the ceiling
    pub fn record_iteration(&mut self) {
        self.iterations += 1;
    }

    pub fn push_assistant(&mut self, text: Option<String>, calls: Vec<ToolCall>) {
        self.turns.push(Turn::Assistant { text, calls });
    }

    pub fn push_tool_results(&mut self, results: Vec<ToolResultTurn>) {
        if !results.is_empty() {
            self.turns.push(Turn::ToolResults(results));
        }
    }
}
