//! Credential management for downstream MCP servers
//!
//! Static headers pass through untouched. OAuth servers go through discovery,
//! dynamic registration and a browser authorization-code flow with PKCE, with
//! tokens cached on disk and refreshed before expiry.

pub mod browser;
pub mod callback_server;
pub mod oauth;
pub mod provider;
pub mod token_storage;

pub use browser::{BrowserLauncher, SystemBrowser};
pub use callback_server::{CallbackResult, CallbackServer};
pub use oauth::{AuthorizationServerMetadata, OAuthClient, OAuthTokenResponse, TokenEndpointError};
pub use provider::CredentialProvider;
pub use token_storage::{ClientRegistration, Credential, FileTokenStorage};
