//! sharplet: lazy-loading, idle-evicting model residency for scene prediction.
//!
//! One model instance is loaded on first use, shared by every caller through
//! leases, and released after it sits idle. HTTP and MCP front-ends drive it
//! through [`SceneService`].

pub mod artifacts;
pub mod bridge;
pub mod config;
pub mod device;
pub mod health;
pub mod pipeline;
pub mod residency;
pub mod service;
pub mod status;
pub mod transport;
pub mod version;
pub mod worker;

pub use artifacts::{ArtifactStore, TaskResult};
pub use config::{Config, ConfigError};
pub use device::{Device, DeviceProbe, PinnedProbe, SystemProbe, select_device};
pub use health::{Health, HealthSnapshot};
pub use pipeline::{PipelineError, SceneInfo, SceneModel};
pub use residency::{
    Lease, LoadError, Loader, ManagerConfig, ResidentResource, ResourceManager, loader_fn,
};
pub use service::{SceneService, ServiceError};
pub use status::{MemoryUsage, ResidencyState, StatusSnapshot};
pub use version::{SHARPLET_VERSION, VersionInfo};
pub use worker::{CommandSpawner, WorkerLoader, WorkerLoaderConfig, WorkerModel};
