//! MCP server exposing a single `fetch` tool.
//!
//! The tool performs one HTTP request per call and returns the response
//! metadata plus the body, as text or as a base64 encoded image.

pub mod core;
pub mod tools;
