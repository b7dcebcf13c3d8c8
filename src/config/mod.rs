//! Configuration module for agent-mcp
//!
//! This module provides configuration management and loading utilities.

mod config;
pub mod environment;

pub use config::{
    default_token_dir, AuthDetails, AuthSetting, Config, LlmConfig, McpClientConfig,
    McpServerConfig, OAuthFlowConfig, DEFAULT_MAX_ITERATIONS,
};
pub use environment::{expand_env_vars, EnvVars, DEFAULT_CONFIG_FILE};
