//! Version information for sharplet.

/// Sharplet version from Cargo.toml
pub const SHARPLET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name reported by the health endpoint.
pub const SERVICE_NAME: &str = "sharp";

/// Version information for the runtime.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Sharplet runtime version.
    pub sharplet: &'static str,
    /// Model worker command line (if configured).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            sharplet: SHARPLET_VERSION,
            worker: None,
        }
    }
}

impl VersionInfo {
    /// Create version info with the sharplet version only.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, command: impl Into<String>) -> Self {
        self.worker = Some(command.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_sharplet_version() {
        let info = VersionInfo::new();
        assert_eq!(info.sharplet, SHARPLET_VERSION);
        assert!(info.worker.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            sharplet: "0.1.0",
            worker: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "sharplet": "0.1.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_full() {
        let info = VersionInfo {
            sharplet: "0.1.0",
            ..VersionInfo::new().with_worker("python -m sharp_worker")
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "sharplet": "0.1.0",
          "worker": "python -m sharp_worker"
        }
        "#);
    }
}
