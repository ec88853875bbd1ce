/// Core Server Framework Module
///
/// - config.rs: environment-driven server configuration
/// - protocol.rs: JSON-RPC 2.0 and MCP message types
/// - server.rs: tool registry, dispatcher, HTTP and STDIO transports

pub mod config;
pub mod protocol;
pub mod server;
