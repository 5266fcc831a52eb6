//! Device selection for model placement.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Compute backend a model instance can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Mps,
    Cpu,
}

impl Device {
    /// Selection order, best first. CPU is last and always available.
    pub const PREFERENCE: [Device; 3] = [Device::Cuda, Device::Mps, Device::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Mps => "mps",
            Self::Cpu => "cpu",
        }
    }

    /// Trajectory rendering needs the CUDA rasterizer.
    pub fn supports_rendering(&self) -> bool {
        matches!(self, Self::Cuda)
    }

    /// Whether the worker can report allocator statistics for this device.
    pub fn reports_memory(&self) -> bool {
        matches!(self, Self::Cuda)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown device '{0}', expected one of: cuda, mps, cpu")]
pub struct UnknownDevice(String);

impl FromStr for Device {
    type Err = UnknownDevice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "mps" => Ok(Self::Mps),
            "cpu" => Ok(Self::Cpu),
            _ => Err(UnknownDevice(s.to_string())),
        }
    }
}

/// Answers "is this device usable right now?" for the selector.
pub trait DeviceProbe: Send + Sync {
    fn is_available(&self, device: Device) -> bool;
}

/// Probes the host: NVIDIA driver nodes for CUDA, Apple silicon for MPS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl SystemProbe {
    fn cuda_available() -> bool {
        // An empty or "-1" mask hides every GPU from the runtime.
        if let Ok(mask) = std::env::var("CUDA_VISIBLE_DEVICES") {
            let mask = mask.trim();
            if mask.is_empty() || mask == "-1" {
                return false;
            }
        }
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
    }
}

impl DeviceProbe for SystemProbe {
    fn is_available(&self, device: Device) -> bool {
        match device {
            Device::Cuda => Self::cuda_available(),
            Device::Mps => cfg!(all(target_os = "macos", target_arch = "aarch64")),
            Device::Cpu => true,
        }
    }
}

/// Reports exactly one device as available (plus the CPU fallback).
///
/// Used for `SHARPLET_DEVICE` overrides and in tests.
#[derive(Debug, Clone, Copy)]
pub struct PinnedProbe(pub Device);

impl DeviceProbe for PinnedProbe {
    fn is_available(&self, device: Device) -> bool {
        device == self.0 || device == Device::Cpu
    }
}

/// Pick the first available device in [`Device::PREFERENCE`] order.
pub fn select_device(probe: &dyn DeviceProbe) -> Device {
    Device::PREFERENCE
        .into_iter()
        .find(|device| *device == Device::Cpu || probe.is_available(*device))
        .unwrap_or(Device::Cpu)
}
