//! HTTP transport.

mod routes;
mod server;

pub use routes::{routes, web_ui};
pub use server::{ServerConfig, serve};
