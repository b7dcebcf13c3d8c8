//! Error handling for agent-mcp

mod error;

pub use error::{AgentError, FailureKind, Result};
