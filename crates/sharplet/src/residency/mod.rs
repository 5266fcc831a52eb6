//! Model residency: one lazily loaded, idle-evicted model instance per manager.
//!
//! - `acquire` loads the model on first demand (single-flight: concurrent callers
//!   share one load episode and its outcome) and hands out a [`Lease`].
//! - An idle watchdog releases the model once it has been unused for longer than
//!   the configured timeout, then stops until the next load restarts it.
//! - `force_release` evicts out-of-band; `status` never waits on a load.
//!
//! Leases close the use-after-release gap: the watchdog skips eviction while a
//! lease is outstanding, and a forced release only detaches the instance, which
//! is dropped when its last lease is returned. A new load does not start until
//! the previous instance is gone, so at most one instance is ever alive.

mod lease;
mod manager;
mod watchdog;

use std::future::Future;

use async_trait::async_trait;

use crate::device::Device;
use crate::status::MemoryUsage;

pub use lease::Lease;
pub use manager::{ManagerConfig, ResourceManager};

/// A model instance the manager can own.
///
/// Dropping the value must release everything it holds on the device.
pub trait ResidentResource: Send + Sync + 'static {
    /// Latest allocator figures, if known. Called under the slot lock; must be cheap.
    fn memory_usage(&self) -> Option<MemoryUsage> {
        None
    }
}

/// Produces a ready model instance bound to `device`.
///
/// Invoked at most once per load episode.
#[async_trait]
pub trait Loader<R>: Send + Sync {
    async fn load(&self, device: Device) -> Result<R, LoadError>;
}

/// Adapter turning an async closure into a [`Loader`].
pub struct LoaderFn<F>(F);

pub fn loader_fn<F>(f: F) -> LoaderFn<F> {
    LoaderFn(f)
}

#[async_trait]
impl<R, F, Fut> Loader<R> for LoaderFn<F>
where
    R: Send + 'static,
    F: Fn(Device) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, LoadError>> + Send,
{
    async fn load(&self, device: Device) -> Result<R, LoadError> {
        (self.0)(device).await
    }
}

/// Why `acquire` could not produce a lease.
///
/// Cloneable: every caller waiting on a load episode receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("model load failed: {0}")]
    Failed(String),

    #[error("model load ended without a result")]
    Lost,

    #[error("resource manager is shut down")]
    ShutDown,
}

impl LoadError {
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}
