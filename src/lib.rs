//! agent-mcp - expose MCP servers as single-instruction sub-agents
//!
//! Every configured downstream MCP server becomes one tool taking a
//! natural-language `instruction`. A call opens a fresh connection to the
//! server, lets an LLM drive its native tools in a bounded loop and returns
//! the final answer.

pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod mcp;
pub mod registry;

pub use config::Config;
pub use error::{AgentError, FailureKind, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
