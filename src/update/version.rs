use serde::{Deserialize, Serialize};

use crate::error::{AssetError, Result};

/// Version document published next to each manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionInfo {
    pub version: String,
    pub manifest_hash: String,
    /// Byte size of the manifest document; zero when unknown.
    pub manifest_size: u64,
    pub build_time: String,
    pub min_app_version: String,
    pub force_update: bool,
}

impl VersionInfo {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            AssetError::ManifestUnavailable(format!("invalid version document: {}", e))
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| AssetError::ManifestUnavailable(format!("serialize version: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    NoUpdate,
    OptionalUpdate,
    ForceUpdate,
    CheckFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheckResult {
    pub status: UpdateStatus,
    pub local_version: Option<String>,
    pub remote_version: Option<String>,
    pub download_size: u64,
    pub download_count: usize,
    pub error: Option<String>,
}

impl UpdateCheckResult {
    pub(crate) fn failed(local_version: Option<String>, error: impl ToString) -> Self {
        Self {
            status: UpdateStatus::CheckFailed,
            local_version,
            remote_version: None,
            download_size: 0,
            download_count: 0,
            error: Some(error.to_string()),
        }
    }

    pub fn has_update(&self) -> bool {
        matches!(
            self.status,
            UpdateStatus::OptionalUpdate | UpdateStatus::ForceUpdate
        )
    }
}
