//! Credential resolution for downstream servers
//!
//! `obtain` is the single entry point. For OAuth servers the whole
//! cache-check, refresh, authorize sequence runs under a per-server async
//! lock, so concurrent invocations against one server share a single browser
//! flow and never interleave writes to its cache file.

use crate::auth::browser::{BrowserLauncher, SystemBrowser};
use crate::auth::callback_server::{CallbackResult, CallbackServer};
use crate::auth::oauth::{
    generate_pkce_challenge, generate_pkce_verifier, generate_state, AuthorizationRequest,
    AuthorizationServerMetadata, OAuthClient,
};
use crate::auth::token_storage::{ClientRegistration, Credential, FileTokenStorage};
use crate::config::{Config, OAuthFlowConfig};
use crate::error::{AgentError, Result};
use crate::registry::{AuthMode, OAuthSettings, ServerDescriptor};
use chrono::Utc;
use dashmap::DashMap;
use secrecy::Secret;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

const OAUTH_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves the current valid credential for a server
pub struct CredentialProvider {
    storage: FileTokenStorage,
    oauth: OAuthClient,
    browser: Arc<dyn BrowserLauncher>,
    callback_timeout: Duration,
    refresh_skew: chrono::Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CredentialProvider {
    pub fn new(
        storage: FileTokenStorage,
        flow: &OAuthFlowConfig,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Result<Self> {
        let refresh_skew = chrono::Duration::seconds(
            i64::try_from(flow.refresh_skew_secs)
                .map_err(|_| AgentError::config("oauth.refresh_skew_secs is out of range"))?,
        );
        Ok(Self {
            storage,
            oauth: OAuthClient::new(OAUTH_HTTP_TIMEOUT)?,
            browser,
            callback_timeout: Duration::from_secs(flow.callback_timeout_secs),
            refresh_skew,
            locks: DashMap::new(),
        })
    }

    /// Provider using the configured token directory and the system browser
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            FileTokenStorage::new(config.token_dir()),
            &config.oauth,
            Arc::new(SystemBrowser),
        )
    }

    /// Return a valid credential, authorizing interactively when needed
    pub async fn obtain(&self, descriptor: &ServerDescriptor) -> Result<Credential> {
        match &descriptor.auth {
            AuthMode::None => Ok(Credential::empty()),
            AuthMode::StaticHeader { value, .. } => Ok(Credential::from_static(value.clone())),
            AuthMode::OAuth(settings) => {
                let lock = self.lock_for(&descriptor.name);
                let _guard = lock.lock().await;
                self.obtain_oauth(descriptor, settings).await
            }
        }
    }

    fn lock_for(&self, server_name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(server_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn obtain_oauth(
        &self,
        descriptor: &ServerDescriptor,
        settings: &OAuthSettings,
    ) -> Result<Credential> {
        let name = descriptor.name.as_str();
        let resource = descriptor.url().ok_or_else(|| {
            AgentError::config(format!("Server '{}': oauth requires an http url", name))
        })?;

        if let Some(cached) = self.storage.load_tokens(name) {
            if cached.is_usable_at(Utc::now(), self.refresh_skew) {
                debug!("Using cached OAuth token for '{}'", name);
                return Ok(cached);
            }
            if let Some(refresh_token) = cached.refresh_token.clone() {
                if let Some(client) = self.client_for_refresh(name, settings) {
                    return self
                        .refresh(name, resource, settings, &client, refresh_token)
                        .await;
                }
                warn!(
                    "Cached token for '{}' expired but no client registration is cached; re-authorizing",
                    name
                );
            } else {
                info!("Cached token for '{}' expired and cannot be refreshed; re-authorizing", name);
            }
        } else {
            info!("No cached token for '{}', starting OAuth flow", name);
        }

        self.authorize(descriptor, resource, settings).await
    }

    fn client_for_refresh(&self, name: &str, settings: &OAuthSettings) -> Option<ClientRegistration> {
        match self.storage.load_client_info(name) {
            Some(client) => Some(client),
            None => settings.client_id.as_ref().map(|client_id| ClientRegistration {
                client_id: client_id.clone(),
                client_secret: settings.client_secret.clone(),
                redirect_uris: Vec::new(),
                token_endpoint: None,
            }),
        }
    }

    async fn refresh(
        &self,
        name: &str,
        resource: &Url,
        settings: &OAuthSettings,
        client: &ClientRegistration,
        refresh_token: Secret<String>,
    ) -> Result<Credential> {
        let token_endpoint = match &client.token_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => self.oauth.discover(resource).await?.token_endpoint,
        };
        let client = ClientRegistration {
            client_secret: client
                .client_secret
                .clone()
                .or_else(|| settings.client_secret.clone()),
            ..client.clone()
        };

        info!("Refreshing OAuth token for '{}'", name);
        match self
            .oauth
            .refresh(&token_endpoint, &client, &refresh_token, resource.as_str())
            .await
        {
            Ok(response) => {
                let credential =
                    Credential::from_token_response(response, Some(refresh_token), Utc::now());
                self.storage.save_tokens(name, &credential)?;
                Ok(credential)
            }
            Err(e) if e.is_unrecoverable() => {
                warn!("Refresh for '{}' rejected ({}); clearing cached credentials", name, e);
                self.storage.clear(name)?;
                Err(AgentError::auth(format!(
                    "Token refresh for '{}' was rejected ({}); cached credentials were cleared and the next call will re-authorize",
                    name, e
                )))
            }
            Err(e) => Err(AgentError::auth(format!(
                "Token refresh for '{}' failed: {}",
                name, e
            ))),
        }
    }

    async fn authorize(
        &self,
        descriptor: &ServerDescriptor,
        resource: &Url,
        settings: &OAuthSettings,
    ) -> Result<Credential> {
        let mut listener = CallbackServer::start()?;
        let result = self
            .run_authorization(descriptor, resource, settings, &mut listener)
            .await;
        listener.stop().await;
        result
    }

    async fn run_authorization(
        &self,
        descriptor: &ServerDescriptor,
        resource: &Url,
        settings: &OAuthSettings,
        listener: &mut CallbackServer,
    ) -> Result<Credential> {
        let name = descriptor.name.as_str();
        let redirect_uri = listener.redirect_uri();
        let metadata = self.oauth.discover(resource).await?;
        let client = self
            .client_registration(name, settings, &metadata, &redirect_uri)
            .await?;

        let verifier = generate_pkce_verifier();
        let challenge = generate_pkce_challenge(&verifier);
        let state = generate_state();
        let scopes = if settings.scopes.is_empty() {
            metadata.scopes_supported.clone()
        } else {
            settings.scopes.clone()
        };

        let authorization_url = AuthorizationRequest {
            authorization_endpoint: &metadata.authorization_endpoint,
            client_id: &client.client_id,
            redirect_uri: &redirect_uri,
            code_challenge: &challenge,
            state: &state,
            scopes: &scopes,
            resource: resource.as_str(),
        }
        .to_url()?;

        self.browser.open(authorization_url.as_str()).await?;

        let code = match listener.wait(self.callback_timeout).await? {
            CallbackResult::Code {
                code,
                state: returned,
            } => {
                if returned.as_deref() != Some(state.as_str()) {
                    return Err(AgentError::auth(format!(
                        "Authorization for '{}' returned a mismatched state parameter",
                        name
                    )));
                }
                code
            }
            CallbackResult::Error { error, description } => {
                return Err(AgentError::auth(match description {
                    Some(description) => format!(
                        "Authorization for '{}' failed: {} ({})",
                        name, error, description
                    ),
                    None => format!("Authorization for '{}' failed: {}", name, error),
                }));
            }
        };

        let response = match self
            .oauth
            .exchange_code(
                &metadata.token_endpoint,
                &client,
                &code,
                &redirect_uri,
                &verifier,
                resource.as_str(),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.is_unrecoverable() {
                    warn!("Code exchange for '{}' rejected ({}); clearing client registration", name, e);
                    self.storage.clear(name)?;
                }
                return Err(e.into());
            }
        };

        let credential = Credential::from_token_response(response, None, Utc::now());
        self.storage.save_tokens(name, &credential)?;
        info!("OAuth authorization for '{}' completed", name);
        Ok(credential)
    }

    async fn client_registration(
        &self,
        name: &str,
        settings: &OAuthSettings,
        metadata: &AuthorizationServerMetadata,
        redirect_uri: &str,
    ) -> Result<ClientRegistration> {
        let client = if let Some(client_id) = &settings.client_id {
            ClientRegistration {
                client_id: client_id.clone(),
                client_secret: settings.client_secret.clone(),
                redirect_uris: vec![redirect_uri.to_string()],
                token_endpoint: None,
            }
        } else {
            match self.storage.load_client_info(name) {
                Some(cached) if cached.redirect_uris.iter().any(|u| u == redirect_uri) => cached,
                _ => {
                    let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
                        AgentError::auth(format!(
                            "Authorization server for '{}' does not support dynamic client registration; set auth.client_id",
                            name
                        ))
                    })?;
                    self.oauth
                        .register(endpoint, &format!("agent-mcp ({})", name), redirect_uri, &settings.scopes)
                        .await?
                }
            }
        };

        let client = ClientRegistration {
            token_endpoint: Some(metadata.token_endpoint.clone()),
            ..client
        };
        self.storage.save_client_info(name, &client)?;
        Ok(client)
    }

    /// Delete cached credentials for the given servers. Returns `(name, existed)` pairs.
    pub fn clear(&self, names: &[String]) -> Result<Vec<(String, bool)>> {
        names
            .iter()
            .map(|name| Ok((name.clone(), self.storage.clear(name)?)))
            .collect()
    }

    pub fn list_cached(&self) -> Result<Vec<String>> {
        self.storage.list_cached()
    }
}
