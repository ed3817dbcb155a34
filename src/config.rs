use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AssetError, Result};

/// Interval at which the download scheduler refills its active set.
pub const SCHEDULER_POLL_INTERVAL_MS: u64 = 50;

/// Interval at which a running batch publishes progress.
pub const PROGRESS_INTERVAL_MS: u64 = 100;

/// Minimum spacing between two throughput samples.
pub const SPEED_SAMPLE_INTERVAL_MS: u64 = 1000;

/// Name of the cache index document kept beside the cached bundle files.
pub const CACHE_INDEX_FILE_NAME: &str = "cache_index.json";

/// Suffix of partially downloaded bundle files.
pub const TEMP_FILE_SUFFIX: &str = ".tmp";

/// Share of the threshold used to derive the default cleanup target.
pub const CLEANUP_TARGET_FACTOR: f64 = 0.8;

/// Where bundles come from at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayMode {
    /// Assets are read straight from the source tree, no bundles involved.
    #[default]
    Simulate,
    /// Bundles are read from the persistent cache or the bundled streaming path.
    Offline,
    /// Missing or stale bundles are downloaded from the remote origin.
    Online,
    /// Bundles are fetched into memory over HTTP, nothing touches the disk.
    Web,
}

/// Top-level configuration for the asset engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub play_mode: PlayMode,
    /// Origin root; the platform directory is appended to it.
    pub remote_url: String,
    pub platform: String,
    /// Writable directory holding downloaded bundles and the cache index.
    pub cache_dir: PathBuf,
    /// Read-only directory holding bundles shipped with the application.
    pub streaming_dir: PathBuf,
    /// Source tree root used by [`PlayMode::Simulate`].
    pub simulate_root: PathBuf,
    pub manifest_file_name: String,
    pub version_file_name: String,
    pub max_concurrent_downloads: usize,
    pub download_timeout_secs: u64,
    /// Timeout for version and manifest fetches; tighter than payload fetches.
    pub metadata_timeout_secs: u64,
    pub max_retry_count: u32,
    pub retry_delay_ms: u64,
    pub enable_breakpoint_resume: bool,
    pub max_cache_size: u64,
    pub cache_expiration_days: u32,
    pub enable_auto_cleanup: bool,
    /// Usage ratio at which an automatic cleanup pass starts.
    pub cleanup_threshold: f64,
    /// Extra headers sent with every origin request.
    pub headers: HashMap<String, String>,
    pub enable_preload: bool,
    /// Preloads allowed to run at once.
    pub max_preload_tasks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            play_mode: PlayMode::Simulate,
            remote_url: "http://localhost:8080/".to_string(),
            platform: default_platform().to_string(),
            cache_dir: PathBuf::from("bundle_cache"),
            streaming_dir: PathBuf::from("streaming_assets"),
            simulate_root: PathBuf::from("."),
            manifest_file_name: "manifest.json".to_string(),
            version_file_name: "version.json".to_string(),
            max_concurrent_downloads: 5,
            download_timeout_secs: 30,
            metadata_timeout_secs: 10,
            max_retry_count: 3,
            retry_delay_ms: 1000,
            enable_breakpoint_resume: true,
            max_cache_size: 1024 * 1024 * 1024, // 1 GB
            cache_expiration_days: 30,
            enable_auto_cleanup: true,
            cleanup_threshold: 0.9,
            headers: HashMap::new(),
            enable_preload: true,
            max_preload_tasks: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AssetError::Config(format!("invalid config document: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(AssetError::Config(
                "max_concurrent_downloads must be > 0".to_string(),
            ));
        }
        if !(self.cleanup_threshold > 0.0 && self.cleanup_threshold <= 1.0) {
            return Err(AssetError::Config(format!(
                "cleanup_threshold {} outside (0, 1]",
                self.cleanup_threshold
            )));
        }
        if matches!(self.play_mode, PlayMode::Online | PlayMode::Web)
            && self.remote_url.trim().is_empty()
        {
            return Err(AssetError::Config(format!(
                "{:?} mode requires a remote_url",
                self.play_mode
            )));
        }
        Ok(())
    }

    /// Directory of downloaded bundles for the configured platform.
    pub fn persistent_dir(&self) -> PathBuf {
        self.cache_dir.join(&self.platform)
    }

    /// Directory of bundles shipped with the application for the configured platform.
    pub fn streaming_path(&self) -> PathBuf {
        self.streaming_dir.join(&self.platform)
    }

    /// Origin URL of the platform directory, always ending in `/`.
    pub fn remote_base_url(&self) -> String {
        format!("{}/{}/", self.remote_url.trim_end_matches('/'), self.platform)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_platform() -> &'static str {
    if cfg!(target_os = "android") {
        "Android"
    } else if cfg!(target_os = "ios") {
        "iOS"
    } else if cfg!(target_arch = "wasm32") {
        "WebGL"
    } else if cfg!(target_os = "windows") {
        "Windows"
    } else if cfg!(target_os = "macos") {
        "MacOS"
    } else if cfg!(target_os = "linux") {
        "Linux"
    } else {
        "Unknown"
    }
}
