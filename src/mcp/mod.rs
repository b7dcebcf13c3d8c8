//! MCP (Model Context Protocol) implementation
//!
//! Client side: the connection bridge and its stdio and Streamable HTTP
//! transports. Server side: the front that exposes one instruction tool per
//! downstream server.

pub mod bridge;
// Network clients for downstream MCP services
pub mod clients;
pub mod errors;
pub mod external_process;
pub mod server;
pub mod types;

pub use bridge::{Connector, McpConnection, McpConnector, McpSession, OperationOutcome, RpcTransport};
pub use clients::StreamableHttpTransport;
pub use errors::{McpError, McpErrorCode};
pub use external_process::StdioTransport;
pub use server::McpServer;
pub use types::*;
