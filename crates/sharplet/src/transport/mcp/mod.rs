//! MCP tool interface: newline-delimited JSON-RPC 2.0 over stdio.
//!
//! Requests are handled concurrently; a single writer task owns the output so
//! response lines never interleave. Logs must go to stderr while this runs.

mod protocol;
mod server;
mod tools;

pub use protocol::{JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse, error_codes, methods};
pub use server::{McpServer, serve_stdio};
pub use tools::{ToolDefinition, tool_definitions, tool_names};
