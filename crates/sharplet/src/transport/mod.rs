//! Front-ends for the scene service.
//!
//! HTTP via axum for uploads and downloads, MCP (JSON-RPC over stdio) for
//! tool-calling clients. Both delegate to [`crate::service::SceneService`].

pub mod http;
pub mod mcp;
mod shutdown;

pub use http::{ServerConfig, serve};
