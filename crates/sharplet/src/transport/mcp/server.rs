//! JSON-RPC session loop and method dispatch.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::protocol::{
    JsonRpcId, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, error_codes, methods,
};
use super::tools::{call_tool, tool_definitions};
use crate::pipeline::SceneModel;
use crate::service::SceneService;
use crate::transport::shutdown::shutdown_signal;
use crate::version::{SERVICE_NAME, SHARPLET_VERSION};

/// Longest request line accepted.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

pub struct McpServer<M: SceneModel> {
    service: Arc<SceneService<M>>,
}

impl<M: SceneModel> McpServer<M> {
    pub fn new(service: Arc<SceneService<M>>) -> Self {
        Self { service }
    }

    /// Handle one input line. `None` means nothing is sent back.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to parse request");
                return Some(JsonRpcResponse::error(
                    None,
                    error_codes::PARSE_ERROR,
                    format!("Parse error: {e}"),
                ));
            }
        };

        let id = value
            .get("id")
            .cloned()
            .and_then(|id| serde_json::from_value::<JsonRpcId>(id).ok());
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    id,
                    error_codes::INVALID_REQUEST,
                    format!("Invalid request: {e}"),
                ));
            }
        };

        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                request.id,
                error_codes::INVALID_REQUEST,
                "Invalid JSON-RPC version",
            ));
        }

        self.dispatch(request).await
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            match request.method.as_str() {
                methods::INITIALIZED => info!("MCP client initialized"),
                other => debug!(method = other, "Ignoring notification"),
            }
            return None;
        }

        let id = request.id;
        let response = match request.method.as_str() {
            methods::INITIALIZE => {
                info!("MCP initialize request received");
                JsonRpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {
                            "tools": { "listChanged": false }
                        },
                        "serverInfo": {
                            "name": SERVICE_NAME,
                            "version": SHARPLET_VERSION
                        }
                    }),
                )
            }
            methods::PING => JsonRpcResponse::success(id, json!({})),
            methods::TOOLS_LIST => {
                JsonRpcResponse::success(id, json!({ "tools": tool_definitions() }))
            }
            methods::TOOLS_CALL => self.tools_call(id, request.params).await,
            other => JsonRpcResponse::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        };
        Some(response)
    }

    async fn tools_call(&self, id: Option<JsonRpcId>, params: Option<Value>) -> JsonRpcResponse {
        let Some(params) = params else {
            return JsonRpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                "Missing params for tools/call",
            );
        };
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return JsonRpcResponse::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("Invalid params for tools/call: {e}"),
                );
            }
        };

        debug!(tool = %params.name, "Calling tool");
        let arguments = params.arguments.unwrap_or_else(|| json!({}));
        match call_tool(&self.service, &params.name, arguments).await {
            Ok(output) => JsonRpcResponse::success(id, output.into_result()),
            Err(e) => JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, e.to_string()),
        }
    }

    /// Run one session until `reader` reaches EOF or shutdown is requested.
    ///
    /// In-flight requests are allowed to finish before returning.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut sink = FramedWrite::new(writer, LinesCodec::new());

        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let line = serde_json::to_string(&response)?;
                sink.send(line).await?;
            }
            Ok::<_, anyhow::Error>(())
        });

        let shutdown = shutdown_signal(self.service.shutdown_rx());
        tokio::pin!(shutdown);
        let mut in_flight = JoinSet::new();

        info!("MCP session ready");
        loop {
            let next = tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Request handler ended abnormally");
                    }
                    continue;
                }
                next = lines.next() => next,
            };

            match next {
                None => {
                    debug!("Input closed, ending MCP session");
                    break;
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(limit = MAX_LINE_BYTES, "Request line too long");
                    let _ = tx.send(JsonRpcResponse::error(
                        None,
                        error_codes::PARSE_ERROR,
                        "Parse error: request line too long",
                    ));
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    warn!(error = %e, "Failed to read request, ending MCP session");
                    break;
                }
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let server = Arc::clone(&self);
                    let tx = tx.clone();
                    in_flight.spawn(async move {
                        if let Some(response) = server.handle_line(&line).await {
                            // Receiver is gone only if the writer already failed.
                            let _ = tx.send(response);
                        }
                    });
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Request handler ended abnormally");
            }
        }
        drop(tx);
        writer_task.await??;

        info!("MCP session ended");
        Ok(())
    }
}

/// Serve MCP on this process's stdin/stdout.
pub async fn serve_stdio<M: SceneModel>(service: Arc<SceneService<M>>) -> anyhow::Result<()> {
    let server = Arc::new(McpServer::new(service));
    server.serve(tokio::io::stdin(), tokio::io::stdout()).await
}
