//! SceneService: transport-agnostic request orchestration.
//!
//! Each request goes validate/stage input -> acquire a lease -> run the
//! pipeline -> persist artifacts -> respond. The service owns:
//! - The resource manager and the loader it acquires with
//! - The artifact store (output directory)
//! - Shutdown coordination for the transports
//!
//! HTTP and MCP both delegate here and only translate results to their wire.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::artifacts::{ArtifactError, ArtifactStore, StagedInput, TaskResult, file_url, new_task_id};
use crate::health::{Health, HealthSnapshot};
use crate::pipeline::{
    OUTPUT_FORMAT, PipelineError, PredictRequest, RenderRequest, SUPPORTED_IMAGE_EXTENSIONS,
    SceneInfo, SceneModel, is_supported_image,
};
use crate::residency::{Lease, LoadError, Loader, ResourceManager};
use crate::status::StatusSnapshot;
use crate::version::VersionInfo;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of a single-file prediction.
#[derive(Debug, Clone, Serialize)]
pub struct PredictFileResult {
    pub status: &'static str,
    pub output_path: String,
    pub image_info: SceneInfo,
}

/// One file of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchEntry {
    fn success(file: &Path, output: &Path) -> Self {
        Self {
            file: file.display().to_string(),
            output: Some(output.display().to_string()),
            status: "success",
            error: None,
        }
    }

    fn failure(file: &Path, error: String) -> Self {
        Self {
            file: file.display().to_string(),
            output: None,
            status: "error",
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub status: &'static str,
    pub processed: usize,
    pub results: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupportedFormats {
    pub image_extensions: &'static [&'static str],
    pub output_format: &'static str,
}

/// Transport-agnostic scene prediction service.
pub struct SceneService<M: SceneModel> {
    manager: ResourceManager<M>,
    loader: Arc<dyn Loader<M>>,
    artifacts: ArtifactStore,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    version: VersionInfo,
}

impl<M: SceneModel> SceneService<M> {
    pub fn new(
        manager: ResourceManager<M>,
        loader: Arc<dyn Loader<M>>,
        artifacts: ArtifactStore,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            manager,
            loader,
            artifacts,
            shutdown_tx,
            shutdown_rx,
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn manager(&self) -> &ResourceManager<M> {
        &self.manager
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn health(&self) -> HealthSnapshot {
        let status = if *self.shutdown_rx.borrow() {
            Health::ShuttingDown
        } else {
            Health::Healthy
        };
        HealthSnapshot::new(status, self.version.clone())
    }

    pub fn status(&self) -> StatusSnapshot {
        self.manager.status()
    }

    /// Force the model out of device memory. Returns whether one was loaded.
    pub fn offload(&self) -> bool {
        self.manager.force_release()
    }

    pub fn supported_formats(&self) -> SupportedFormats {
        SupportedFormats {
            image_extensions: SUPPORTED_IMAGE_EXTENSIONS,
            output_format: OUTPUT_FORMAT,
        }
    }

    async fn acquire(&self) -> Result<Lease<M>, ServiceError> {
        Ok(self.manager.acquire(&self.loader).await?)
    }

    /// Run `predict`, releasing the instance if it turned out to be unusable.
    async fn predict_with(
        &self,
        lease: &Lease<M>,
        request: PredictRequest,
    ) -> Result<SceneInfo, PipelineError> {
        let id = request.id.clone();
        let result = lease.predict(request).await;
        if let Err(e) = &result {
            tracing::warn!(request_id = %id, device = %lease.device(), error = %e, "Prediction failed");
            self.release_if_broken(lease, e);
        }
        result
    }

    /// Detach the instance when `err` means it can no longer serve requests.
    /// Returns whether the lease is now dead.
    fn release_if_broken(&self, lease: &Lease<M>, err: &PipelineError) -> bool {
        let broken = matches!(err, PipelineError::WorkerGone(_) | PipelineError::Protocol(_));
        if broken {
            self.manager.release_instance(lease);
        }
        broken
    }

    /// Predict from an uploaded image; the staged file is removed afterwards.
    pub async fn predict_upload(
        &self,
        staged: StagedInput,
        render_video: bool,
    ) -> Result<TaskResult, ServiceError> {
        let result = self.run_upload(&staged, render_video).await;
        staged.remove().await;
        result
    }

    async fn run_upload(
        &self,
        staged: &StagedInput,
        render_video: bool,
    ) -> Result<TaskResult, ServiceError> {
        let task_id = staged.task_id.as_str();
        let lease = self.acquire().await?;

        let ply_path = self.artifacts.ply_path(task_id);
        let scene = self
            .predict_with(
                &lease,
                PredictRequest {
                    id: task_id.to_string(),
                    image_path: staged.path.clone(),
                    output_path: ply_path.clone(),
                },
            )
            .await?;
        tracing::info!(%task_id, width = scene.width, height = scene.height, "Scene predicted");

        let mut result = TaskResult::new(task_id, false);
        if !render_video {
            return Ok(result);
        }
        if !lease.device().supports_rendering() {
            tracing::debug!(%task_id, device = %lease.device(), "Skipping video render on this device");
            return Ok(result);
        }

        let render = lease
            .render(RenderRequest {
                id: task_id.to_string(),
                ply_path,
                video_path: self.artifacts.video_path(task_id),
                scene,
            })
            .await;
        match render {
            Ok(video_path) => {
                let name = video_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{task_id}.mp4"));
                result.video_url = Some(file_url(&name));
            }
            Err(e) => {
                tracing::warn!(%task_id, error = %e, "Video rendering failed");
                self.release_if_broken(&lease, &e);
            }
        }
        Ok(result)
    }

    /// Predict from an image already on disk.
    ///
    /// Defaults the output to `{output_dir}/{stem}.ply`.
    pub async fn predict_file(
        &self,
        file_path: &Path,
        output_path: Option<&Path>,
    ) -> Result<PredictFileResult, ServiceError> {
        if !tokio::fs::try_exists(file_path).await.unwrap_or(false) {
            return Err(ServiceError::NotFound(format!(
                "File not found: {}",
                file_path.display()
            )));
        }
        check_supported(file_path)?;

        let output = match output_path {
            Some(path) => path.to_path_buf(),
            None => self.artifacts.root().join(ply_name(file_path)),
        };
        if let Some(parent) = output.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let lease = self.acquire().await?;
        let scene = self
            .predict_with(
                &lease,
                PredictRequest {
                    id: new_task_id(),
                    image_path: file_path.to_path_buf(),
                    output_path: output.clone(),
                },
            )
            .await?;

        Ok(PredictFileResult {
            status: "success",
            output_path: output.display().to_string(),
            image_info: scene,
        })
    }

    /// Predict every supported image in `input_dir` (not recursive).
    ///
    /// Runs under one lease. If the worker dies mid-batch the model is reloaded
    /// and the batch continues on the fresh instance; a failed reload marks the
    /// remaining files as errors.
    pub async fn batch_predict(
        &self,
        input_dir: &Path,
        output_dir: Option<&Path>,
    ) -> Result<BatchResult, ServiceError> {
        let is_dir = tokio::fs::metadata(input_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(ServiceError::InvalidInput(format!(
                "Not a directory: {}",
                input_dir.display()
            )));
        }

        let out_dir = output_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.artifacts.root().to_path_buf());
        tokio::fs::create_dir_all(&out_dir).await?;

        let images = list_images(input_dir).await?;
        if images.is_empty() {
            return Err(ServiceError::InvalidInput("No images found".to_string()));
        }

        let mut lease = self.acquire().await?;
        tracing::info!(count = images.len(), dir = %input_dir.display(), "Starting batch prediction");

        let mut results = Vec::with_capacity(images.len());
        let mut pending = images.into_iter();
        while let Some(image) = pending.next() {
            let output = out_dir.join(ply_name(&image));
            let request = PredictRequest {
                id: new_task_id(),
                image_path: image.clone(),
                output_path: output.clone(),
            };
            let err = match self.predict_with(&lease, request).await {
                Ok(_) => {
                    results.push(BatchEntry::success(&image, &output));
                    continue;
                }
                Err(e) => e,
            };
            results.push(BatchEntry::failure(&image, err.to_string()));
            if !self.release_if_broken(&lease, &err) {
                continue;
            }

            // The released instance must be gone before a new one can load.
            drop(lease);
            tracing::warn!(remaining = pending.len(), "Model worker lost mid-batch, reloading");
            lease = match self.acquire().await {
                Ok(fresh) => fresh,
                Err(load) => {
                    let reason = load.to_string();
                    results.extend(pending.by_ref().map(|rest| BatchEntry::failure(&rest, reason.clone())));
                    break;
                }
            };
        }

        Ok(BatchResult {
            status: "success",
            processed: results.len(),
            results,
        })
    }

    pub async fn task_result(&self, task_id: &str) -> Result<TaskResult, ServiceError> {
        self.artifacts
            .task_result(task_id)
            .await
            .ok_or_else(|| ServiceError::NotFound("Result not found".to_string()))
    }

    /// Path of a produced file, for download.
    pub async fn artifact(&self, filename: &str) -> Result<PathBuf, ServiceError> {
        match self.artifacts.resolve(filename).await {
            Ok(path) => Ok(path),
            Err(ArtifactError::NotFound | ArtifactError::InvalidName(_)) => {
                Err(ServiceError::NotFound("File not found".to_string()))
            }
            Err(ArtifactError::Io(e)) => Err(e.into()),
        }
    }

    /// Signal transports to stop, then release the model.
    pub async fn shutdown(&self) {
        self.trigger_shutdown();
        self.manager.shutdown().await;
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

fn ply_name(image: &Path) -> String {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scene".to_string());
    format!("{stem}.ply")
}

fn check_supported(path: &Path) -> Result<(), ServiceError> {
    if is_supported_image(path) {
        return Ok(());
    }
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| "(none)".to_string());
    Err(ServiceError::InvalidInput(
        PipelineError::UnsupportedInput(ext).to_string(),
    ))
}

async fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_supported_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Reject unsupported upload names before anything is written.
pub fn validate_upload_name(filename: &str) -> Result<(), ServiceError> {
    if filename.trim().is_empty() {
        return Err(ServiceError::InvalidInput("Empty filename".to_string()));
    }
    check_supported(Path::new(filename))
}
