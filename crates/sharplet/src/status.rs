//! Residency status types reported by the status endpoint and tool.

use serde::{Deserialize, Serialize};

use crate::device::Device;

/// Where the resource slot currently is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResidencyState {
    /// No instance; the next acquire loads one.
    #[default]
    Empty,
    /// A load episode is in flight.
    Loading,
    /// An instance is resident on its device.
    Loaded,
}

/// Device allocator figures, in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    #[serde(rename = "gpu_memory_allocated_mb")]
    pub allocated_mb: f64,
    #[serde(rename = "gpu_memory_reserved_mb")]
    pub reserved_mb: f64,
}

impl MemoryUsage {
    pub fn from_bytes(allocated: u64, reserved: u64) -> Self {
        const MIB: f64 = 1024.0 * 1024.0;
        Self {
            allocated_mb: round2(allocated as f64 / MIB),
            reserved_mb: round2(reserved as f64 / MIB),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Point-in-time view of the resource slot.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub model_loaded: bool,
    pub state: ResidencyState,
    pub device: Option<Device>,
    /// Configured idle timeout, whole seconds.
    pub idle_timeout: u64,
    /// Seconds since the instance was last used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_seconds: Option<f64>,
    /// When the current instance finished loading (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<String>,
    pub active_leases: usize,
    pub watchdog_running: bool,
    #[serde(flatten)]
    pub memory: Option<MemoryUsage>,
}

impl StatusSnapshot {
    pub fn is_loaded(&self) -> bool {
        self.model_loaded
    }
}
