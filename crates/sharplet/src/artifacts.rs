//! Output directory layout: staged uploads, scenes and videos per task.
//!
//! ```text
//! {root}/{task_id}_input.{ext}   upload, removed after the request
//! {root}/{task_id}.ply           predicted scene
//! {root}/{task_id}.mp4           trajectory video (CUDA only)
//! ```

use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

/// Public URL prefix artifacts are downloaded from.
pub const FILES_ROUTE: &str = "/api/files";

pub fn file_url(filename: &str) -> String {
    format!("{FILES_ROUTE}/{filename}")
}

/// Short random id naming one request's files.
pub fn new_task_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Locators for a finished task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub ply_url: String,
    pub video_url: Option<String>,
}

impl TaskResult {
    pub fn new(task_id: &str, has_video: bool) -> Self {
        Self {
            task_id: task_id.to_string(),
            ply_url: file_url(&format!("{task_id}.ply")),
            video_url: has_video.then(|| file_url(&format!("{task_id}.mp4"))),
        }
    }
}

/// An uploaded image written to the output directory for the worker to read.
#[derive(Debug)]
pub struct StagedInput {
    pub task_id: String,
    pub path: PathBuf,
}

impl StagedInput {
    pub async fn remove(self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staged input");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("file not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub fn ply_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{task_id}.ply"))
    }

    pub fn video_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{task_id}.mp4"))
    }

    /// Write an upload under a fresh task id, keeping the original extension.
    pub async fn stage_upload(&self, original_name: &str, bytes: &[u8]) -> io::Result<StagedInput> {
        self.ensure_root().await?;
        let task_id = new_task_id();
        let suffix = Path::new(original_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let path = self.root.join(format!("{task_id}_input{suffix}"));
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(%task_id, path = %path.display(), size = bytes.len(), "Staged upload");
        Ok(StagedInput { task_id, path })
    }

    /// Map a download name to a file in the store.
    ///
    /// Only a single plain path component is accepted.
    pub async fn resolve(&self, filename: &str) -> Result<PathBuf, ArtifactError> {
        let mut components = Path::new(filename).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(ArtifactError::InvalidName(filename.to_string())),
        }

        let path = self.root.join(filename);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(ArtifactError::NotFound),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ArtifactError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Locators for `task_id` if its scene exists.
    pub async fn task_result(&self, task_id: &str) -> Option<TaskResult> {
        let ply = self.resolve(&format!("{task_id}.ply")).await.ok()?;
        let has_video = self.resolve(&format!("{task_id}.mp4")).await.is_ok();
        tracing::trace!(path = %ply.display(), has_video, "Found task result");
        Some(TaskResult::new(task_id, has_video))
    }
}
