//! Model worker process: the loader that starts it and the model handle that
//! talks to it.
//!
//! Flow:
//! 1. Spawn the worker subprocess (stdin/stdout piped, stderr inherited)
//! 2. Send `init` with the selected device, wait for `ready` (setup timeout)
//! 3. Serve `predict`/`render` one at a time over the same channel
//! 4. On drop: close the channel, SIGTERM, kill after the grace period

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{SceneInfo, WorkerRequest, WorkerResponse};
use crate::device::Device;
use crate::pipeline::{PipelineError, PredictRequest, RenderRequest, SceneModel};
use crate::residency::{LoadError, Loader, ResidentResource};
use crate::status::MemoryUsage;

const WORKER_LOG_TARGET: &str = "sharplet::worker";

pub const DEFAULT_WORKER_COMMAND: &str = "python -m sharp_worker";

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn forward_worker_log(level: &str, message: &str) {
    match level.to_ascii_lowercase().as_str() {
        "error" | "critical" | "fatal" => tracing::error!(target: WORKER_LOG_TARGET, "{message}"),
        "warn" | "warning" => tracing::warn!(target: WORKER_LOG_TARGET, "{message}"),
        "debug" => tracing::debug!(target: WORKER_LOG_TARGET, "{message}"),
        "trace" => tracing::trace!(target: WORKER_LOG_TARGET, "{message}"),
        _ => tracing::info!(target: WORKER_LOG_TARGET, "{message}"),
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub device: Device,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// A running worker: its protocol pipes plus the process to reap, if any.
pub struct WorkerProcess {
    reader: BoxedReader,
    writer: BoxedWriter,
    child: Option<Child>,
}

impl WorkerProcess {
    /// Take over a child spawned with piped stdin and stdout.
    pub fn from_child(mut child: Child) -> Result<Self, SpawnError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    /// A worker reached over arbitrary pipes, with no process to manage.
    pub fn from_io(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<WorkerProcess, SpawnError>;
}

/// Runs a fixed command line, e.g. `python -m sharp_worker`.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    /// Split on whitespace; no shell quoting.
    pub fn from_command_line(command: &str) -> Result<Self, SpawnError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| SpawnError::Other("empty worker command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl Default for CommandSpawner {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["-m".to_string(), "sharp_worker".to_string()],
        }
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<WorkerProcess, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env("SHARPLET_DEVICE", config.device.as_str())
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        WorkerProcess::from_child(child)
    }
}

pub struct WorkerLoaderConfig {
    pub model_path: Option<PathBuf>,
    pub setup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for WorkerLoaderConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            setup_timeout: Duration::from_secs(900),
            shutdown_grace: Duration::from_secs(10),
            spawner: Arc::new(CommandSpawner::default()),
        }
    }
}

impl WorkerLoaderConfig {
    pub fn with_model_path(mut self, path: Option<PathBuf>) -> Self {
        self.model_path = path;
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker setup failed: {0}")]
    Setup(String),
    #[error("worker setup timed out after {}s", .0.as_secs())]
    SetupTimeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("worker exited before it was ready")]
    WorkerExited,
}

impl From<HandshakeError> for LoadError {
    fn from(err: HandshakeError) -> Self {
        LoadError::failed(err)
    }
}

/// Loads the model by starting a worker process bound to the device.
pub struct WorkerLoader {
    config: WorkerLoaderConfig,
}

impl WorkerLoader {
    pub fn new(config: WorkerLoaderConfig) -> Self {
        Self { config }
    }

    async fn start(&self, device: Device) -> Result<WorkerModel, HandshakeError> {
        tracing::info!(%device, "Spawning model worker");
        let WorkerProcess {
            reader,
            writer,
            child,
        } = self.config.spawner.spawn(&WorkerSpawnConfig { device })?;
        let process = ProcessGuard::new(child, self.config.shutdown_grace);

        let mut writer = FramedWrite::new(writer, JsonCodec::<WorkerRequest>::new());
        let mut reader = FramedRead::new(reader, JsonCodec::<WorkerResponse>::new());

        tracing::debug!("Sending init to worker");
        writer
            .send(WorkerRequest::Init {
                device,
                model_path: self.config.model_path.clone(),
            })
            .await
            .map_err(|e| HandshakeError::Protocol(format!("failed to send init: {e}")))?;

        tracing::debug!("Waiting for ready from worker");
        let ready = tokio::time::timeout(self.config.setup_timeout, async {
            loop {
                match reader.next().await {
                    Some(Ok(WorkerResponse::Ready { memory })) => return Ok(memory),
                    Some(Ok(WorkerResponse::Log { level, message })) => {
                        forward_worker_log(&level, &message);
                    }
                    Some(Ok(WorkerResponse::Failed { error, .. })) => {
                        return Err(HandshakeError::Setup(error));
                    }
                    Some(Ok(WorkerResponse::Fatal { reason })) => {
                        return Err(HandshakeError::Setup(format!("worker fatal: {reason}")));
                    }
                    Some(Ok(other)) => {
                        tracing::warn!(?other, "Unexpected message during setup");
                    }
                    Some(Err(e)) => {
                        return Err(HandshakeError::Protocol(format!("worker channel error: {e}")));
                    }
                    None => return Err(HandshakeError::WorkerExited),
                }
            }
        })
        .await;

        let memory = match ready {
            Ok(Ok(memory)) => memory,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(HandshakeError::SetupTimeout(self.config.setup_timeout)),
        };

        Ok(WorkerModel {
            device,
            channel: Mutex::new(Channel {
                writer,
                reader,
                pending: None,
                broken: None,
            }),
            memory: StdMutex::new(memory),
            _process: process,
        })
    }
}

#[async_trait]
impl Loader<WorkerModel> for WorkerLoader {
    async fn load(&self, device: Device) -> Result<WorkerModel, LoadError> {
        let model = self.start(device).await?;
        tracing::info!(%device, "Model worker ready");
        Ok(model)
    }
}

struct Channel {
    writer: FramedWrite<BoxedWriter, JsonCodec<WorkerRequest>>,
    reader: FramedRead<BoxedReader, JsonCodec<WorkerResponse>>,
    /// Request sent whose reply has not been read yet.
    pending: Option<String>,
    /// Set once the worker is unusable; every later request fails with it.
    broken: Option<String>,
}

impl Channel {
    fn gone(&mut self, reason: String) -> PipelineError {
        self.broken = Some(reason.clone());
        PipelineError::WorkerGone(reason)
    }

    fn protocol(&mut self, reason: String) -> PipelineError {
        self.broken = Some(reason.clone());
        PipelineError::Protocol(reason)
    }

    async fn read_reply(&mut self, id: &str) -> Result<WorkerResponse, PipelineError> {
        loop {
            match self.reader.next().await {
                Some(Ok(WorkerResponse::Log { level, message })) => {
                    forward_worker_log(&level, &message);
                }
                Some(Ok(WorkerResponse::Fatal { reason })) => {
                    return Err(self.gone(format!("worker fatal: {reason}")));
                }
                Some(Ok(response)) => {
                    let answers = match response.request_id() {
                        Some(reply_id) => reply_id == id,
                        None => matches!(response, WorkerResponse::Failed { .. }),
                    };
                    if !answers {
                        return Err(self.protocol(format!(
                            "unexpected frame while waiting for {id}: {response:?}"
                        )));
                    }
                    self.pending = None;
                    return Ok(response);
                }
                Some(Err(e)) => return Err(self.gone(format!("worker channel error: {e}"))),
                None => return Err(self.gone("worker closed its output".to_string())),
            }
        }
    }
}

/// Handle to a ready model worker.
///
/// Requests are serialized over one channel. A caller that goes away
/// mid-request leaves its reply pending; the next request drains it first.
pub struct WorkerModel {
    device: Device,
    channel: Mutex<Channel>,
    memory: StdMutex<Option<MemoryUsage>>,
    _process: ProcessGuard,
}

impl WorkerModel {
    pub fn device(&self) -> Device {
        self.device
    }

    fn record_memory(&self, memory: Option<MemoryUsage>) {
        if memory.is_some() {
            *self.memory.lock().unwrap_or_else(PoisonError::into_inner) = memory;
        }
    }

    async fn exchange(
        &self,
        request: WorkerRequest,
        id: &str,
    ) -> Result<WorkerResponse, PipelineError> {
        let mut channel = self.channel.lock().await;
        if let Some(reason) = &channel.broken {
            return Err(PipelineError::WorkerGone(reason.clone()));
        }

        if let Some(stale) = channel.pending.clone() {
            tracing::debug!(request_id = %stale, "Draining reply to an abandoned request");
            channel.read_reply(&stale).await?;
        }

        channel.pending = Some(id.to_string());
        if let Err(e) = channel.writer.send(request).await {
            return Err(channel.gone(format!("failed to send request: {e}")));
        }
        channel.read_reply(id).await
    }
}

impl ResidentResource for WorkerModel {
    fn memory_usage(&self) -> Option<MemoryUsage> {
        *self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SceneModel for WorkerModel {
    async fn predict(&self, request: PredictRequest) -> Result<SceneInfo, PipelineError> {
        let PredictRequest {
            id,
            image_path,
            output_path,
        } = request;
        let reply = self
            .exchange(
                WorkerRequest::Predict {
                    id: id.clone(),
                    image_path,
                    output_path,
                },
                &id,
            )
            .await?;

        match reply {
            WorkerResponse::Predicted { scene, memory, .. } => {
                self.record_memory(memory);
                Ok(scene)
            }
            WorkerResponse::Failed { error, .. } => Err(PipelineError::Worker(error)),
            other => Err(PipelineError::Protocol(format!(
                "unexpected reply to predict: {other:?}"
            ))),
        }
    }

    async fn render(&self, request: RenderRequest) -> Result<PathBuf, PipelineError> {
        let RenderRequest {
            id,
            ply_path,
            video_path,
            scene,
        } = request;
        let reply = self
            .exchange(
                WorkerRequest::Render {
                    id: id.clone(),
                    ply_path,
                    video_path,
                    scene,
                },
                &id,
            )
            .await?;

        match reply {
            WorkerResponse::Rendered {
                video_path, memory, ..
            } => {
                self.record_memory(memory);
                Ok(video_path)
            }
            WorkerResponse::Failed { error, .. } => Err(PipelineError::Worker(error)),
            other => Err(PipelineError::Protocol(format!(
                "unexpected reply to render: {other:?}"
            ))),
        }
    }
}

/// Terminates the worker process when the model is dropped.
struct ProcessGuard {
    child: StdMutex<Option<Child>>,
    grace: Duration,
}

impl ProcessGuard {
    fn new(child: Option<Child>, grace: Duration) -> Self {
        Self {
            child: StdMutex::new(child),
            grace,
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let slot = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(mut child) = slot.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(terminate(child, self.grace));
            }
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "Failed to kill model worker");
                }
            }
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub(crate) async fn terminate(mut child: Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();
    request_exit(&mut child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(?pid, %status, "Model worker exited");
            Some(status)
        }
        Ok(Err(e)) => {
            tracing::warn!(?pid, error = %e, "Failed to wait for model worker");
            None
        }
        Err(_) => {
            tracing::warn!(
                ?pid,
                grace_secs = grace.as_secs(),
                "Model worker ignored SIGTERM, killing"
            );
            if let Err(e) = child.kill().await {
                tracing::warn!(?pid, error = %e, "Failed to kill model worker");
            }
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Failed to send SIGTERM to model worker");
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.start_kill();
}
