//! The domain pipeline run against a leased model: predict a scene, optionally
//! render a trajectory video from it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::residency::ResidentResource;

pub use crate::bridge::protocol::SceneInfo;

/// Image types the model worker can decode. Matched case-insensitively.
pub const SUPPORTED_IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".heic", ".heif", ".tif", ".tiff", ".bmp", ".webp",
];

/// Describes the artifact `predict` writes.
pub const OUTPUT_FORMAT: &str = ".ply (3D Gaussian Splat)";

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .is_some_and(|ext| SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictRequest {
    pub id: String,
    pub image_path: PathBuf,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub id: String,
    pub ply_path: PathBuf,
    pub video_path: PathBuf,
    pub scene: SceneInfo,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unsupported image format: {0}")]
    UnsupportedInput(String),

    #[error("{0}")]
    Worker(String),

    #[error("model worker is gone: {0}")]
    WorkerGone(String),

    #[error("worker protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A loaded scene-prediction model.
///
/// Implementations serialize their own requests; callers may share one
/// instance across tasks through leases.
#[async_trait]
pub trait SceneModel: ResidentResource {
    /// Write the predicted scene to `request.output_path` as PLY.
    async fn predict(&self, request: PredictRequest) -> Result<SceneInfo, PipelineError>;

    /// Render a trajectory video. Only called on devices that support rendering.
    async fn render(&self, request: RenderRequest) -> Result<PathBuf, PipelineError>;
}
