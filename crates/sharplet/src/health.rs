//! Health status types for the sharplet runtime.

use serde::{Deserialize, Serialize};

use crate::version::{SERVICE_NAME, VersionInfo};

/// Liveness of the service. Model residency is reported separately by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Accepting requests; the model may or may not be loaded.
    #[default]
    Healthy,
    /// Shutdown requested; in-flight requests are draining.
    ShuttingDown,
}

/// Body of the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    pub service: &'static str,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn new(status: Health, version: VersionInfo) -> Self {
        Self {
            status,
            service: SERVICE_NAME,
            version,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == Health::Healthy
    }
}
