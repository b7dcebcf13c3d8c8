//! Descriptor types for downstream MCP servers

use secrecy::{ExposeSecret, Secret};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// How a downstream server is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launch or connect parameters
#[derive(Debug, Clone)]
pub enum LaunchSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
    },
    Http {
        url: url::Url,
        headers: HashMap<String, String>,
    },
}

/// OAuth client settings for one server
#[derive(Debug, Clone, Default)]
pub struct OAuthSettings {
    pub scopes: Vec<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<Secret<String>>,
}

/// How requests to a downstream server are authorized
#[derive(Clone)]
pub enum AuthMode {
    None,
    /// A fixed header sent verbatim on every request
    StaticHeader { name: String, value: Secret<String> },
    OAuth(OAuthSettings),
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::StaticHeader { .. } => "static",
            AuthMode::OAuth(_) => "oauth",
        }
    }
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::None => write!(f, "None"),
            AuthMode::StaticHeader { name, value } => f
                .debug_struct("StaticHeader")
                .field("name", name)
                .field("value_len", &value.expose_secret().len())
                .finish(),
            AuthMode::OAuth(settings) => f
                .debug_struct("OAuth")
                .field("scopes", &settings.scopes)
                .field("client_id", &settings.client_id)
                .finish(),
        }
    }
}

/// Immutable description of one downstream server
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    pub name: String,
    pub description: String,
    pub transport: TransportKind,
    pub launch: LaunchSpec,
    pub auth: AuthMode,
}

impl ServerDescriptor {
    /// Endpoint URL for http descriptors
    pub fn url(&self) -> Option<&url::Url> {
        match &self.launch {
            LaunchSpec::Http { url, .. } => Some(url),
            LaunchSpec::Stdio { .. } => None,
        }
    }

    pub fn requires_oauth(&self) -> bool {
        matches!(self.auth, AuthMode::OAuth(_))
    }
}
