//! Registry of downstream MCP servers exposed as instruction tools

pub mod service;
pub mod types;

pub use service::ServerRegistry;
pub use types::{AuthMode, LaunchSpec, OAuthSettings, ServerDescriptor, TransportKind};
