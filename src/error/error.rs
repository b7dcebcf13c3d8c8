//! Error types and handling for agent-mcp

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for agent-mcp operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Failure categories surfaced to front clients.
///
/// Every terminating path of an invocation is tagged with exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    ConfigError,
    ConnectionError,
    AuthError,
    AuthTimeout,
    OperationError,
    IterationLimitExceeded,
    UnexpectedFault,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ConfigError => "ConfigError",
            FailureKind::ConnectionError => "ConnectionError",
            FailureKind::AuthError => "AuthError",
            FailureKind::AuthTimeout => "AuthTimeout",
            FailureKind::OperationError => "OperationError",
            FailureKind::IterationLimitExceeded => "IterationLimitExceeded",
            FailureKind::UnexpectedFault => "UnexpectedFault",
            FailureKind::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for agent-mcp
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transport could not be established or was lost
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Authorization exchange rejected
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// User did not complete the browser authorization step in time
    #[error("Authorization timed out: {message}")]
    AuthTimeout { message: String },

    /// A single downstream operation failed
    #[error("Operation error: {operation}: {message}")]
    Operation { operation: String, message: String },

    /// Loop ended without a final answer
    #[error("Iteration limit exceeded: {message}")]
    IterationLimit { message: String },

    /// MCP protocol errors
    #[error("MCP protocol error: {message}")]
    Mcp { message: String },

    /// LLM provider errors
    #[error("LLM error: {message}")]
    Llm { message: String },

    /// Run was cancelled by the caller
    #[error("Cancelled: {message}")]
    Cancelled { message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AgentError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create an authorization timeout error
    pub fn auth_timeout<S: Into<String>>(message: S) -> Self {
        Self::AuthTimeout {
            message: message.into(),
        }
    }

    /// Create an operation error
    pub fn operation<S: Into<String>, M: Into<String>>(operation: S, message: M) -> Self {
        Self::Operation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an iteration limit error
    pub fn iteration_limit<S: Into<String>>(message: S) -> Self {
        Self::IterationLimit {
            message: message.into(),
        }
    }

    /// Create an MCP protocol error
    pub fn mcp<S: Into<String>>(message: S) -> Self {
        Self::Mcp {
            message: message.into(),
        }
    }

    /// Create an LLM provider error
    pub fn llm<S: Into<String>>(message: S) -> Self {
        Self::Llm {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Map this error onto the failure taxonomy reported to clients
    pub fn kind(&self) -> FailureKind {
        match self {
            AgentError::Config { .. } | AgentError::Yaml(_) | AgentError::Url(_) => {
                FailureKind::ConfigError
            }
            AgentError::Connection { .. } => FailureKind::ConnectionError,
            AgentError::Auth { .. } => FailureKind::AuthError,
            AgentError::AuthTimeout { .. } => FailureKind::AuthTimeout,
            AgentError::Operation { .. } => FailureKind::OperationError,
            AgentError::IterationLimit { .. } => FailureKind::IterationLimitExceeded,
            AgentError::Cancelled { .. } => FailureKind::Cancelled,
            AgentError::Mcp { .. }
            | AgentError::Llm { .. }
            | AgentError::Io(_)
            | AgentError::Serde(_)
            | AgentError::Http(_)
            | AgentError::Internal(_) => FailureKind::UnexpectedFault,
        }
    }

    /// Short message without the category prefix, used in client-facing error strings
    pub fn message(&self) -> String {
        match self {
            AgentError::Config { message }
            | AgentError::Connection { message }
            | AgentError::Auth { message }
            | AgentError::AuthTimeout { message }
            | AgentError::IterationLimit { message }
            | AgentError::Mcp { message }
            | AgentError::Llm { message }
            | AgentError::Cancelled { message } => message.clone(),
            AgentError::Operation { operation, message } => format!("{}: {}", operation, message),
            other => other.to_string(),
        }
    }
}
