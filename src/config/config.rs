//! Configuration structures and loading

use crate::config::environment::{load_env_files, resolve_config_path, resolve_env_placeholders};
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

fn default_model() -> String {
    "anthropic/claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    8096
}

fn default_transport() -> String {
    "stdio".to_string()
}

fn default_protocol_version() -> String {
    "2025-06-18".to_string()
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_callback_timeout() -> u64 {
    300
}

fn default_refresh_skew() -> u64 {
    60
}

/// Default ceiling on operation calls per invocation
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// LLM model identifier, optionally prefixed with a provider (`anthropic/...`, `openai/...`)
    #[serde(default = "default_model")]
    pub model: String,
    /// Maximum tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Ceiling on operation calls per invocation
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Older name for `max_iterations`; wins when both are present
    #[serde(default)]
    pub max_llm_calls: Option<u32>,
    /// Directory holding the per-server OAuth token cache
    #[serde(default)]
    pub token_dir: Option<String>,
    /// Extra system prompt text appended to every sub-agent run
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// LLM provider settings
    #[serde(default)]
    pub llm: LlmConfig,
    /// Downstream MCP client settings
    #[serde(default)]
    pub client: McpClientConfig,
    /// OAuth browser flow settings
    #[serde(default)]
    pub oauth: OAuthFlowConfig,
    /// Downstream servers keyed by tool name
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

/// LLM provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Override for the provider base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// HTTP timeout for a single completion call
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: None,
            base_url: None,
            timeout_secs: default_llm_timeout(),
        }
    }
}

/// Settings for connections to downstream MCP servers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpClientConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// MCP protocol version to use
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Client name for MCP handshake
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Client version for MCP handshake
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            protocol_version: default_protocol_version(),
            client_name: default_client_name(),
            client_version: default_client_version(),
        }
    }
}

/// OAuth browser flow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthFlowConfig {
    /// How long to wait for the browser redirect
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
    /// Tokens expiring within this window are treated as expired
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: u64,
}

impl Default for OAuthFlowConfig {
    fn default() -> Self {
        Self {
            callback_timeout_secs: default_callback_timeout(),
            refresh_skew_secs: default_refresh_skew(),
        }
    }
}

/// One downstream server entry as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Tool description shown to front clients
    #[serde(default)]
    pub description: String,
    /// `stdio` or `http`
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Command to execute (stdio)
    #[serde(default)]
    pub command: Option<String>,
    /// Command arguments (stdio)
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the child process (stdio)
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process (stdio)
    #[serde(default)]
    pub cwd: Option<String>,
    /// Endpoint URL (http)
    #[serde(default)]
    pub url: Option<String>,
    /// Extra request headers (http)
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Authorization setting
    #[serde(default)]
    pub auth: Option<AuthSetting>,
}

/// `auth:` accepts either a bare mode name or a detailed mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthSetting {
    Mode(String),
    Detailed(AuthDetails),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthDetails {
    #[serde(rename = "type")]
    pub kind: String,
    /// Header name for static auth
    #[serde(default)]
    pub header: Option<String>,
    /// Header value for static auth, sent verbatim
    #[serde(default)]
    pub value: Option<String>,
    /// Requested OAuth scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Pre-registered OAuth client id; skips dynamic registration
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl AuthSetting {
    pub fn kind(&self) -> &str {
        match self {
            AuthSetting::Mode(mode) => mode.as_str(),
            AuthSetting::Detailed(details) => details.kind.as_str(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            max_iterations: None,
            max_llm_calls: None,
            token_dir: None,
            system_prompt: None,
            llm: LlmConfig::default(),
            client: McpClientConfig::default(),
            oauth: OAuthFlowConfig::default(),
            servers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration. Resolution order: explicit path, `AGENT_MCP_CONFIG`, `./config.yaml`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_env_files();

        let path = resolve_config_path(path);
        if !path.exists() {
            return Err(AgentError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            AgentError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&content)?;
        info!(
            "Loaded configuration from {} ({} server(s))",
            path.display(),
            config.servers.len()
        );
        Ok(config)
    }

    /// Parse configuration text, resolving `${VAR}` placeholders before typed decoding
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut raw: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| AgentError::config(format!("Failed to parse config file: {}", e)))?;

        if !raw.is_mapping() {
            return Err(AgentError::config(
                "Expected config to be a mapping at the top level",
            ));
        }

        resolve_env_placeholders(&mut raw);

        let config: Config = serde_yaml::from_value(raw)
            .map_err(|e| AgentError::config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate top-level settings. Per-server validation happens when the registry is built.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(AgentError::config("model must not be empty"));
        }
        if self.max_tokens == 0 {
            return Err(AgentError::config("max_tokens must be greater than 0"));
        }
        if self.max_iterations() == 0 {
            return Err(AgentError::config("max_iterations must be at least 1"));
        }
        if self.client.request_timeout_secs == 0 {
            return Err(AgentError::config("client.request_timeout_secs must be greater than 0"));
        }
        if self.oauth.callback_timeout_secs == 0 {
            return Err(AgentError::config("oauth.callback_timeout_secs must be greater than 0"));
        }
        Ok(())
    }

    /// Effective iteration ceiling
    pub fn max_iterations(&self) -> u32 {
        self.max_llm_calls
            .or(self.max_iterations)
            .unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    /// Effective token cache directory with `~` expanded
    pub fn token_dir(&self) -> PathBuf {
        match &self.token_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).into_owned()),
            None => default_token_dir(),
        }
    }
}

/// `~/.agent-mcp/tokens`, or a relative fallback when no home directory is known
pub fn default_token_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .map(|home| home.join(".agent-mcp").join("tokens"))
        .unwrap_or_else(|| PathBuf::from(".agent-mcp").join("tokens"));
    debug!("Using default token directory {}", dir.display());
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml_str("servers: {}").unwrap();
        assert_eq!(config.model, "anthropic/claude-sonnet-4-20250514");
        assert_eq!(config.max_tokens, 8096);
        assert_eq!(config.max_iterations(), 20);
        assert_eq!(config.client.protocol_version, "2025-06-18");
        assert_eq!(config.oauth.callback_timeout_secs, 300);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_max_llm_calls_takes_precedence() {
        let config = Config::from_yaml_str("max_iterations: 7\nmax_llm_calls: 3\n").unwrap();
        assert_eq!(config.max_iterations(), 3);

        let config = Config::from_yaml_str("max_iterations: 7\n").unwrap();
        assert_eq!(config.max_iterations(), 7);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let err = Config::from_yaml_str("max_iterations: 0\n").unwrap_err();
        assert!(matches!(err, AgentError::Config { .. }));
    }

    #[test]
    fn test_non_mapping_rejected() {
        let err = Config::from_yaml_str("- a\n- b\n").unwrap_err();
        assert!(err.to_string().contains("mapping"));
    }

    #[test]
    fn test_token_dir_tilde_expansion() {
        let config = Config::from_yaml_str("token_dir: ~/custom/tokens\n").unwrap();
        let dir = config.token_dir();
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert!(dir.ends_with("custom/tokens"));
    }

    #[test]
    fn test_auth_setting_forms() {
        let yaml = r#"
servers:
  github:
    transport: http
    url: https://example.com/mcp
    auth: oauth
  linear:
    transport: http
    url: https://example.com/linear
    auth:
      type: static
      header: X-Api-Key
      value: abc
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.servers["github"].auth.as_ref().unwrap().kind(), "oauth");
        match config.servers["linear"].auth.as_ref().unwrap() {
            AuthSetting::Detailed(details) => {
                assert_eq!(details.kind, "static");
                assert_eq!(details.header.as_deref(), Some("X-Api-Key"));
                assert_eq!(details.value.as_deref(), Some("abc"));
            }
            other => panic!("unexpected auth setting: {:?}", other),
        }
    }
}
