//! Tool catalogue and dispatch onto the scene service.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::pipeline::SceneModel;
use crate::service::SceneService;

pub mod tool_names {
    pub const PREDICT: &str = "predict";
    pub const BATCH_PREDICT: &str = "batch_predict";
    pub const GPU_STATUS: &str = "gpu_status";
    pub const GPU_OFFLOAD: &str = "gpu_offload";
    pub const GET_SUPPORTED_FORMATS: &str = "get_supported_formats";
}

/// Entry of the `tools/list` response.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

fn no_arguments() -> Value {
    json!({ "type": "object", "properties": {} })
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: tool_names::PREDICT,
            description: "Generate a 3D Gaussian Splat (.ply) from a single image.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_path": {
                        "type": "string",
                        "description": "Path to the input image (JPEG, PNG, HEIC, ...)"
                    },
                    "output_path": {
                        "type": "string",
                        "description": "Where to write the PLY file; defaults to the output directory"
                    }
                },
                "required": ["file_path"]
            }),
        },
        ToolDefinition {
            name: tool_names::BATCH_PREDICT,
            description: "Generate a Gaussian Splat for every image in a directory.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "input_dir": {
                        "type": "string",
                        "description": "Directory containing input images (not searched recursively)"
                    },
                    "output_dir": {
                        "type": "string",
                        "description": "Directory for the PLY files; defaults to the output directory"
                    }
                },
                "required": ["input_dir"]
            }),
        },
        ToolDefinition {
            name: tool_names::GPU_STATUS,
            description: "Report whether the model is resident, on which device, and memory usage.",
            input_schema: no_arguments(),
        },
        ToolDefinition {
            name: tool_names::GPU_OFFLOAD,
            description: "Release the model from device memory now.",
            input_schema: no_arguments(),
        },
        ToolDefinition {
            name: tool_names::GET_SUPPORTED_FORMATS,
            description: "List the accepted input image extensions and the output format.",
            input_schema: no_arguments(),
        },
    ]
}

#[derive(Debug, Deserialize)]
struct PredictArgs {
    file_path: PathBuf,
    #[serde(default)]
    output_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct BatchPredictArgs {
    input_dir: PathBuf,
    #[serde(default)]
    output_dir: Option<PathBuf>,
}

/// Why a call never reached its tool. Both map to invalid params.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ToolCallError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: &'static str, reason: String },
}

/// Outcome of a tool that ran: its JSON document and whether it failed.
#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub data: Value,
    pub is_error: bool,
}

impl ToolOutput {
    fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                data,
                is_error: false,
            },
            Err(e) => Self::error(e),
        }
    }

    fn error(err: impl std::fmt::Display) -> Self {
        Self {
            data: json!({ "status": "error", "error": err.to_string() }),
            is_error: true,
        }
    }

    /// MCP `tools/call` result: one text block holding the JSON document.
    pub fn into_result(self) -> Value {
        let text = serde_json::to_string_pretty(&self.data).unwrap_or_else(|_| "{}".to_string());
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": self.is_error
        })
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(
    tool: &'static str,
    arguments: Value,
) -> Result<T, ToolCallError> {
    serde_json::from_value(arguments).map_err(|e| ToolCallError::InvalidArguments {
        tool,
        reason: e.to_string(),
    })
}

pub(crate) async fn call_tool<M: SceneModel>(
    service: &SceneService<M>,
    name: &str,
    arguments: Value,
) -> Result<ToolOutput, ToolCallError> {
    let output = match name {
        tool_names::PREDICT => {
            let args: PredictArgs = parse_args(tool_names::PREDICT, arguments)?;
            match service
                .predict_file(&args.file_path, args.output_path.as_deref())
                .await
            {
                Ok(result) => ToolOutput::ok(result),
                Err(e) => {
                    tracing::warn!(file = %args.file_path.display(), error = %e, "predict tool failed");
                    ToolOutput::error(e)
                }
            }
        }
        tool_names::BATCH_PREDICT => {
            let args: BatchPredictArgs = parse_args(tool_names::BATCH_PREDICT, arguments)?;
            match service
                .batch_predict(&args.input_dir, args.output_dir.as_deref())
                .await
            {
                Ok(result) => ToolOutput::ok(result),
                Err(e) => {
                    tracing::warn!(dir = %args.input_dir.display(), error = %e, "batch_predict tool failed");
                    ToolOutput::error(e)
                }
            }
        }
        tool_names::GPU_STATUS => ToolOutput::ok(service.status()),
        tool_names::GPU_OFFLOAD => {
            let released = service.offload();
            tracing::info!(released, "Offload requested via MCP");
            ToolOutput::ok(json!({
                "status": "success",
                "message": "Model offloaded from GPU"
            }))
        }
        tool_names::GET_SUPPORTED_FORMATS => ToolOutput::ok(service.supported_formats()),
        other => return Err(ToolCallError::UnknownTool(other.to_string())),
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tool_is_listed_once() {
        let names: Vec<_> = tool_definitions().iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            [
                "predict",
                "batch_predict",
                "gpu_status",
                "gpu_offload",
                "get_supported_formats"
            ]
        );
    }

    #[test]
    fn predict_schema_requires_file_path() {
        let tools = tool_definitions();
        let predict = &tools[0];
        assert_eq!(predict.input_schema["required"], json!(["file_path"]));
        let listed = serde_json::to_value(predict).unwrap();
        assert!(listed.get("inputSchema").is_some());
    }

    #[test]
    fn error_output_is_flagged() {
        let result = ToolOutput::error("No images found").into_result();
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["type"], "text");
        let text = result["content"][0]["text"].as_str().unwrap();
        let doc: Value = serde_json::from_str(text).unwrap();
        assert_eq!(doc, json!({ "status": "error", "error": "No images found" }));
    }

    #[test]
    fn missing_required_argument_is_rejected() {
        let err = parse_args::<PredictArgs>("predict", json!({ "output_path": "/tmp/x.ply" }))
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid arguments for predict: missing field `file_path`"));
    }
}
