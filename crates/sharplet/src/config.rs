//! Process configuration, read once from the environment at start-up.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::device::{Device, DeviceProbe, PinnedProbe, SystemProbe};
use crate::residency::ManagerConfig;
use crate::transport::http::ServerConfig;
use crate::worker::{CommandSpawner, DEFAULT_WORKER_COMMAND, WorkerLoaderConfig};

pub const DEFAULT_OUTPUT_DIR: &str = "/tmp/sharp/output";

const MAX_POLL_INTERVAL_SECS: u64 = 24 * 60 * 60;
const MAX_IDLE_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub model_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub worker_command: String,
    pub device: Option<Device>,
    pub worker_setup_timeout: Duration,
    pub max_upload_bytes: usize,
    pub static_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(30),
            model_path: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            host: "0.0.0.0".to_string(),
            port: 8080,
            worker_command: DEFAULT_WORKER_COMMAND.to_string(),
            device: None,
            worker_setup_timeout: Duration::from_secs(900),
            max_upload_bytes: 64 * 1024 * 1024,
            static_dir: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("GPU_IDLE_TIMEOUT") {
            let secs: u64 = parse("GPU_IDLE_TIMEOUT", &v)?;
            if secs > MAX_IDLE_TIMEOUT_SECS {
                return Err(invalid(
                    "GPU_IDLE_TIMEOUT",
                    &v,
                    format!("must be at most {MAX_IDLE_TIMEOUT_SECS}"),
                ));
            }
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = get("GPU_IDLE_POLL_INTERVAL") {
            let secs: u64 = parse("GPU_IDLE_POLL_INTERVAL", &v)?;
            if secs == 0 {
                return Err(invalid("GPU_IDLE_POLL_INTERVAL", &v, "must be at least 1"));
            }
            if secs > MAX_POLL_INTERVAL_SECS {
                return Err(invalid(
                    "GPU_IDLE_POLL_INTERVAL",
                    &v,
                    format!("must be at most {MAX_POLL_INTERVAL_SECS}"),
                ));
            }
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(v) = get("MODEL_PATH") {
            config.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(v);
        }
        if let Some(v) = get("HOST") {
            config.host = v;
        }
        if let Some(v) = get("PORT") {
            config.port = parse("PORT", &v)?;
        }
        if let Some(v) = get("SHARPLET_WORKER_CMD") {
            CommandSpawner::from_command_line(&v)
                .map_err(|e| invalid("SHARPLET_WORKER_CMD", &v, e))?;
            config.worker_command = v;
        }
        if let Some(v) = get("SHARPLET_DEVICE") {
            config.device = Some(parse("SHARPLET_DEVICE", &v)?);
        }
        if let Some(v) = get("SHARPLET_WORKER_SETUP_TIMEOUT") {
            config.worker_setup_timeout =
                Duration::from_secs(parse("SHARPLET_WORKER_SETUP_TIMEOUT", &v)?);
        }
        if let Some(v) = get("SHARPLET_MAX_UPLOAD_MB") {
            let mb: usize = parse("SHARPLET_MAX_UPLOAD_MB", &v)?;
            config.max_upload_bytes = mb.saturating_mul(1024 * 1024);
        }
        if let Some(v) = get("SHARPLET_STATIC_DIR") {
            config.static_dir = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    pub fn probe(&self) -> Arc<dyn DeviceProbe> {
        match self.device {
            Some(device) => Arc::new(PinnedProbe(device)),
            None => Arc::new(SystemProbe),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::default()
            .with_idle_timeout(self.idle_timeout)
            .with_poll_interval(self.poll_interval)
            .with_probe(self.probe())
    }

    pub fn worker_loader_config(&self) -> Result<WorkerLoaderConfig, ConfigError> {
        let spawner = CommandSpawner::from_command_line(&self.worker_command)
            .map_err(|e| invalid("SHARPLET_WORKER_CMD", &self.worker_command, e))?;
        Ok(WorkerLoaderConfig::default()
            .with_model_path(self.model_path.clone())
            .with_setup_timeout(self.worker_setup_timeout)
            .with_spawner(Arc::new(spawner)))
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_upload_bytes: self.max_upload_bytes,
            static_dir: self.static_dir.clone(),
        }
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| invalid(var, value, e))
}

fn invalid(var: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
