//! Wire protocol types for parent-worker communication.
//!
//! A single channel over the worker's stdin/stdout. The parent sends `init`
//! first and waits for `ready`; afterwards requests are answered in order.
//! `log` frames may arrive at any time and are not replies.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::status::MemoryUsage;

/// What the model recovered about the input image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneInfo {
    pub width: u32,
    pub height: u32,
    pub focal_length_px: f64,
}

/// Messages from parent to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Load the model onto `device`. Must be the first message.
    Init {
        device: Device,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_path: Option<PathBuf>,
    },

    /// Predict a Gaussian scene from one image and write it as PLY.
    Predict {
        id: String,
        image_path: PathBuf,
        output_path: PathBuf,
    },

    /// Render a camera trajectory video from a predicted scene.
    Render {
        id: String,
        ply_path: PathBuf,
        video_path: PathBuf,
        scene: SceneInfo,
    },

    Shutdown,
}

/// Messages from worker to parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Model is loaded; the worker accepts requests.
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<MemoryUsage>,
    },

    Predicted {
        id: String,
        scene: SceneInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<MemoryUsage>,
    },

    Rendered {
        id: String,
        video_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<MemoryUsage>,
    },

    /// A request (or, with no id, the init) failed. The worker stays usable
    /// for later requests unless it also sends `fatal`.
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: String,
    },

    Log {
        level: String,
        message: String,
    },

    /// Unrecoverable worker error. The worker exits after sending this.
    Fatal {
        reason: String,
    },
}

impl WorkerResponse {
    /// Request id this frame answers, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Predicted { id, .. } | Self::Rendered { id, .. } => Some(id),
            Self::Failed { id, .. } => id.as_deref(),
            Self::Ready { .. } | Self::Log { .. } | Self::Fatal { .. } => None,
        }
    }

    pub fn memory(&self) -> Option<MemoryUsage> {
        match self {
            Self::Ready { memory }
            | Self::Predicted { memory, .. }
            | Self::Rendered { memory, .. } => *memory,
            _ => None,
        }
    }
}
