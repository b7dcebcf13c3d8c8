//! Server registry built once from configuration

use crate::config::{AuthDetails, AuthSetting, Config, McpServerConfig};
use crate::error::{AgentError, Result};
use crate::registry::types::{AuthMode, LaunchSpec, OAuthSettings, ServerDescriptor, TransportKind};
use secrecy::Secret;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const AUTHORIZATION_HEADER: &str = "Authorization";

/// Read-only catalog of downstream server descriptors
#[derive(Debug, Default)]
pub struct ServerRegistry {
    descriptors: Vec<Arc<ServerDescriptor>>,
    index: HashMap<String, usize>,
}

impl ServerRegistry {
    /// Build the registry, failing on the first malformed entry
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = ServerRegistry::default();
        for (name, entry) in &config.servers {
            let descriptor = build_descriptor(name, entry)?;
            debug!(
                "Registered server '{}' ({}, auth={})",
                descriptor.name,
                descriptor.transport,
                descriptor.auth.as_str()
            );
            registry.insert(descriptor)?;
        }
        info!("Server registry ready with {} server(s)", registry.len());
        Ok(registry)
    }

    /// Build a registry from already-constructed descriptors
    pub fn from_descriptors(descriptors: Vec<ServerDescriptor>) -> Result<Self> {
        let mut registry = ServerRegistry::default();
        for descriptor in descriptors {
            registry.insert(descriptor)?;
        }
        Ok(registry)
    }

    fn insert(&mut self, descriptor: ServerDescriptor) -> Result<()> {
        if self.index.contains_key(&descriptor.name) {
            return Err(AgentError::config(format!(
                "Duplicate server name '{}'",
                descriptor.name
            )));
        }
        self.index
            .insert(descriptor.name.clone(), self.descriptors.len());
        self.descriptors.push(Arc::new(descriptor));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ServerDescriptor>> {
        self.index
            .get(name)
            .map(|&i| Arc::clone(&self.descriptors[i]))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<ServerDescriptor>> {
        self.descriptors.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

fn build_descriptor(name: &str, entry: &McpServerConfig) -> Result<ServerDescriptor> {
    if name.trim().is_empty() {
        return Err(AgentError::config("Server name must not be empty"));
    }

    let (transport, launch) = match entry.transport.as_str() {
        "stdio" => {
            let command = entry
                .command
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| {
                    AgentError::config(format!("Server '{}': stdio transport requires 'command'", name))
                })?;
            (
                TransportKind::Stdio,
                LaunchSpec::Stdio {
                    command: command.to_string(),
                    args: entry.args.clone(),
                    env: entry.env.clone(),
                    cwd: entry.cwd.as_ref().map(PathBuf::from),
                },
            )
        }
        "http" => {
            let raw = entry
                .url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| {
                    AgentError::config(format!("Server '{}': http transport requires 'url'", name))
                })?;
            let url = url::Url::parse(raw).map_err(|e| {
                AgentError::config(format!("Server '{}': invalid url '{}': {}", name, raw, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(AgentError::config(format!(
                    "Server '{}': url must use http or https, got '{}'",
                    name,
                    url.scheme()
                )));
            }
            (
                TransportKind::Http,
                LaunchSpec::Http {
                    url,
                    headers: entry.headers.clone(),
                },
            )
        }
        other => {
            return Err(AgentError::config(format!(
                "Server '{}': unknown transport '{}' (expected stdio or http)",
                name, other
            )))
        }
    };

    let auth = build_auth_mode(name, entry)?;
    if transport == TransportKind::Stdio && !matches!(auth, AuthMode::None) {
        return Err(AgentError::config(format!(
            "Server '{}': auth '{}' is only supported with the http transport",
            name,
            auth.as_str()
        )));
    }

    Ok(ServerDescriptor {
        name: name.to_string(),
        description: entry.description.clone(),
        transport,
        launch,
        auth,
    })
}

fn build_auth_mode(name: &str, entry: &McpServerConfig) -> Result<AuthMode> {
    let Some(setting) = &entry.auth else {
        return Ok(AuthMode::None);
    };
    let details = match setting {
        AuthSetting::Mode(_) => AuthDetails::default(),
        AuthSetting::Detailed(details) => details.clone(),
    };

    match setting.kind() {
        "none" => Ok(AuthMode::None),
        "oauth" => Ok(AuthMode::OAuth(OAuthSettings {
            scopes: details.scopes,
            client_id: details.client_id,
            client_secret: details.client_secret.map(Secret::new),
        })),
        "static" => {
            let header = details
                .header
                .unwrap_or_else(|| AUTHORIZATION_HEADER.to_string());
            let value = details
                .value
                .or_else(|| header_value(&entry.headers, &header))
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    AgentError::config(format!(
                        "Server '{}': static auth requires a value for header '{}'",
                        name, header
                    ))
                })?;
            Ok(AuthMode::StaticHeader {
                name: header,
                value: Secret::new(value),
            })
        }
        other => Err(AgentError::config(format!(
            "Server '{}': unknown auth mode '{}' (expected none, static or oauth)",
            name, other
        ))),
    }
}

fn header_value(headers: &HashMap<String, String>, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}
