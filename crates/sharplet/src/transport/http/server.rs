//! HTTP server implementation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use tokio::net::TcpListener;
use tracing::info;

use crate::pipeline::SceneModel;
use crate::service::SceneService;

use super::routes::{routes, web_ui};
use crate::transport::shutdown::shutdown_signal;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request body limit, applied to multipart uploads.
    pub max_upload_bytes: usize,
    /// Directory holding `index.html` and the browser assets; no web UI when unset.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_upload_bytes: 64 * 1024 * 1024,
            static_dir: None,
        }
    }
}

/// Serve the HTTP API until SIGINT, SIGTERM or a service-initiated shutdown,
/// then release the model.
pub async fn serve<M: SceneModel>(
    config: ServerConfig,
    service: Arc<SceneService<M>>,
) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let mut app = routes(service.clone());
    if let Some(dir) = &config.static_dir {
        info!(static_dir = %dir.display(), "Serving web UI");
        app = app.merge(web_ui(dir.clone()));
    }
    let app = app.layer(DefaultBodyLimit::max(config.max_upload_bytes));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(
        addr = %actual_addr,
        idle_timeout_secs = service.manager().idle_timeout().as_secs(),
        "Starting sharplet HTTP server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    info!("Server shutdown complete");

    service.shutdown().await;

    Ok(())
}
