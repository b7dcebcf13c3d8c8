//! OAuth 2.1 client for downstream MCP servers
//!
//! Implements the pieces of the authorization-code flow that talk to the
//! authorization server:
//! - Protected resource metadata discovery (RFC 9728)
//! - Authorization server metadata discovery (RFC 8414, OpenID fallback)
//! - Dynamic client registration (RFC 7591)
//! - PKCE S256 (RFC 7636) and resource indicators (RFC 8707)
//! - Authorization code exchange and refresh token grant

use crate::auth::token_storage::ClientRegistration;
use crate::error::{AgentError, Result};
use base64::{engine::general_purpose, Engine as _};
use rand::Rng;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// OAuth error codes after which cached credentials cannot be reused
const UNRECOVERABLE_ERRORS: &[&str] = &["invalid_grant", "invalid_client", "unauthorized_client"];

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Token endpoint success response
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: Secret<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Token endpoint error body (RFC 6749 section 5.2)
#[derive(Debug, Clone, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Failure talking to a token endpoint
#[derive(Debug, Clone)]
pub struct TokenEndpointError {
    /// OAuth `error` code when the server returned one
    pub code: Option<String>,
    pub message: String,
}

impl TokenEndpointError {
    fn transport<S: Into<String>>(message: S) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Revoked grant or bad client: the cache entry must be dropped
    pub fn is_unrecoverable(&self) -> bool {
        self.code
            .as_deref()
            .map(|code| UNRECOVERABLE_ERRORS.contains(&code))
            .unwrap_or(false)
    }
}

impl std::fmt::Display for TokenEndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<TokenEndpointError> for AgentError {
    fn from(err: TokenEndpointError) -> Self {
        AgentError::auth(err.to_string())
    }
}

/// Authorization server metadata (RFC 8414)
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationServerMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Protected resource metadata (RFC 9728)
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

/// HTTP client for authorization server exchanges
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http_client: Client,
}

impl OAuthClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http_client })
    }

    /// Discover the authorization server for an MCP endpoint.
    ///
    /// Falls back to `<origin>/authorize`, `/token` and `/register` when no
    /// metadata document is published.
    pub async fn discover(&self, resource_url: &Url) -> Result<AuthorizationServerMetadata> {
        let auth_server = match self.discover_protected_resource(resource_url).await {
            Some(prm) => match prm.authorization_servers.first() {
                Some(server) => Url::parse(server).map_err(|e| {
                    AgentError::auth(format!("Invalid authorization server '{}': {}", server, e))
                })?,
                None => resource_url.clone(),
            },
            None => resource_url.clone(),
        };
        let origin = auth_server.origin().ascii_serialization();
        let path = auth_server.path().trim_end_matches('/');

        let mut candidates = Vec::new();
        if !path.is_empty() {
            candidates.push(format!("{}/.well-known/oauth-authorization-server{}", origin, path));
        }
        candidates.push(format!("{}/.well-known/oauth-authorization-server", origin));
        if !path.is_empty() {
            candidates.push(format!("{}/.well-known/openid-configuration{}", origin, path));
        }
        candidates.push(format!("{}/.well-known/openid-configuration", origin));

        for candidate in candidates {
            if let Some(metadata) = self.fetch_json::<AuthorizationServerMetadata>(&candidate).await {
                debug!(
                    "RFC 8414: discovered metadata at {} (issuer={:?})",
                    candidate, metadata.issuer
                );
                if !metadata.code_challenge_methods_supported.is_empty()
                    && !metadata
                        .code_challenge_methods_supported
                        .iter()
                        .any(|m| m == "S256")
                {
                    return Err(AgentError::auth(format!(
                        "Authorization server {} does not support PKCE S256",
                        origin
                    )));
                }
                return Ok(metadata);
            }
        }

        info!(
            "No OAuth metadata published at {}, using default endpoints",
            origin
        );
        Ok(AuthorizationServerMetadata {
            issuer: None,
            authorization_endpoint: format!("{}/authorize", origin),
            token_endpoint: format!("{}/token", origin),
            registration_endpoint: Some(format!("{}/register", origin)),
            scopes_supported: Vec::new(),
            code_challenge_methods_supported: Vec::new(),
        })
    }

    async fn discover_protected_resource(&self, resource_url: &Url) -> Option<ProtectedResourceMetadata> {
        let origin = resource_url.origin().ascii_serialization();
        let path = resource_url.path().trim_end_matches('/');
        let mut candidates = Vec::new();
        if !path.is_empty() {
            candidates.push(format!("{}/.well-known/oauth-protected-resource{}", origin, path));
        }
        candidates.push(format!("{}/.well-known/oauth-protected-resource", origin));

        for candidate in candidates {
            if let Some(metadata) = self.fetch_json::<ProtectedResourceMetadata>(&candidate).await {
                debug!(
                    "RFC 9728: {} names authorization servers {:?}",
                    candidate, metadata.authorization_servers
                );
                return Some(metadata);
            }
        }
        None
    }

    async fn fetch_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Option<T> {
        let response = match self
            .http_client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!("Metadata request to {} failed: {}", url, e);
                return None;
            }
        };
        if !response.status().is_success() {
            debug!("Metadata request to {} returned {}", url, response.status());
            return None;
        }
        match response.json::<T>().await {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Ignoring malformed metadata document at {}: {}", url, e);
                None
            }
        }
    }

    /// Register a public client (RFC 7591)
    pub async fn register(
        &self,
        registration_endpoint: &str,
        client_name: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<ClientRegistration> {
        info!("Registering OAuth client '{}' at {}", client_name, registration_endpoint);

        let mut request = json!({
            "client_name": client_name,
            "redirect_uris": [redirect_uri],
            "token_endpoint_auth_method": "none",
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
        });
        if !scopes.is_empty() {
            request["scope"] = json!(scopes.join(" "));
        }

        let response = self
            .http_client
            .post(registration_endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::auth(format!("Dynamic client registration failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::auth(format!(
                "Dynamic client registration rejected with status {}: {}",
                status, body
            )));
        }

        let registered: RegistrationResponse = response.json().await.map_err(|e| {
            AgentError::auth(format!("Failed to parse registration response: {}", e))
        })?;

        let redirect_uris = if registered.redirect_uris.is_empty() {
            vec![redirect_uri.to_string()]
        } else {
            registered.redirect_uris
        };

        Ok(ClientRegistration {
            client_id: registered.client_id,
            client_secret: registered.client_secret.map(Secret::new),
            redirect_uris,
            token_endpoint: None,
        })
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(
        &self,
        token_endpoint: &str,
        client: &ClientRegistration,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
        resource: &str,
    ) -> std::result::Result<OAuthTokenResponse, TokenEndpointError> {
        let mut params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("client_id", client.client_id.clone()),
            ("code_verifier", code_verifier.to_string()),
            ("resource", resource.to_string()),
        ];
        if let Some(secret) = &client.client_secret {
            params.push(("client_secret", secret.expose_secret().clone()));
        }
        self.post_token_form(token_endpoint, &params).await
    }

    /// Refresh an access token
    pub async fn refresh(
        &self,
        token_endpoint: &str,
        client: &ClientRegistration,
        refresh_token: &Secret<String>,
        resource: &str,
    ) -> std::result::Result<OAuthTokenResponse, TokenEndpointError> {
        let mut params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.expose_secret().clone()),
            ("client_id", client.client_id.clone()),
            ("resource", resource.to_string()),
        ];
        if let Some(secret) = &client.client_secret {
            params.push(("client_secret", secret.expose_secret().clone()));
        }
        self.post_token_form(token_endpoint, &params).await
    }

    async fn post_token_form(
        &self,
        token_endpoint: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<OAuthTokenResponse, TokenEndpointError> {
        debug!("POST {} (grant_type={})", token_endpoint, params[0].1);

        let response = self
            .http_client
            .post(token_endpoint)
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| TokenEndpointError::transport(format!("Token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenEndpointError::transport(format!("Failed to read token response: {}", e)))?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<OAuthErrorResponse>(&body) {
                Ok(err) => TokenEndpointError {
                    code: Some(err.error),
                    message: err
                        .error_description
                        .unwrap_or_else(|| format!("token endpoint returned {}", status)),
                },
                Err(_) => TokenEndpointError::transport(format!(
                    "Token endpoint returned {}: {}",
                    status, body
                )),
            });
        }

        serde_json::from_str::<OAuthTokenResponse>(&body).map_err(|e| {
            TokenEndpointError::transport(format!("Failed to parse token response: {}", e))
        })
    }
}

/// PKCE code verifier: 128 characters from the unreserved set
pub fn generate_pkce_verifier() -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";
    let mut rng = rand::thread_rng();
    (0..128)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// S256 code challenge for a verifier
pub fn generate_pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Random `state` value bound to one authorization attempt
pub fn generate_state() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Parameters of one authorization request
#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    pub authorization_endpoint: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub code_challenge: &'a str,
    pub state: &'a str,
    pub scopes: &'a [String],
    pub resource: &'a str,
}

impl AuthorizationRequest<'_> {
    pub fn to_url(&self) -> Result<Url> {
        let mut url = Url::parse(self.authorization_endpoint).map_err(|e| {
            AgentError::auth(format!(
                "Invalid authorization endpoint '{}': {}",
                self.authorization_endpoint, e
            ))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", self.client_id);
            query.append_pair("redirect_uri", self.redirect_uri);
            query.append_pair("state", self.state);
            query.append_pair("code_challenge", self.code_challenge);
            query.append_pair("code_challenge_method", "S256");
            query.append_pair("resource", self.resource);
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
        }
        Ok(url)
    }
}
