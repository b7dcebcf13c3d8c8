//! Network transports for downstream MCP servers

pub mod streamable_http_client;

pub use streamable_http_client::StreamableHttpTransport;
