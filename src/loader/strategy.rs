// Where bundle bytes come from in each play mode.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::backend::BundleLocation;
use crate::cache::CacheIndex;
use crate::checksum::crc32_bytes;
use crate::config::{EngineConfig, PlayMode};
use crate::download::DownloadManager;
use crate::error::{AssetError, Result};
use crate::manifest::BundleInfo;
use crate::source::RemoteSource;

pub enum LoadStrategy {
    /// Assets come straight from the source tree; bundles are never loaded.
    Simulate { root: PathBuf },
    /// Persistent cache first, then the bundled streaming path.
    Offline {
        cache: CacheIndex,
        streaming_path: PathBuf,
    },
    /// Like offline, downloading bundles that are missing or stale.
    Online {
        cache: CacheIndex,
        streaming_path: PathBuf,
        downloads: Arc<DownloadManager>,
    },
    /// Bundles are fetched into memory and kept there for the session.
    Web {
        base_url: String,
        timeout: Duration,
        source: Arc<dyn RemoteSource>,
        memory: Mutex<HashMap<String, Bytes>>,
    },
}

impl LoadStrategy {
    pub fn from_config(
        config: &EngineConfig,
        cache: CacheIndex,
        source: Arc<dyn RemoteSource>,
        downloads: Arc<DownloadManager>,
    ) -> Self {
        match config.play_mode {
            PlayMode::Simulate => LoadStrategy::Simulate {
                root: config.simulate_root.clone(),
            },
            PlayMode::Offline => LoadStrategy::Offline {
                cache,
                streaming_path: config.streaming_path(),
            },
            PlayMode::Online => LoadStrategy::Online {
                cache,
                streaming_path: config.streaming_path(),
                downloads,
            },
            PlayMode::Web => LoadStrategy::Web {
                base_url: config.remote_base_url(),
                timeout: config.download_timeout(),
                source,
                memory: Mutex::new(HashMap::new()),
            },
        }
    }

    pub fn mode(&self) -> PlayMode {
        match self {
            LoadStrategy::Simulate { .. } => PlayMode::Simulate,
            LoadStrategy::Offline { .. } => PlayMode::Offline,
            LoadStrategy::Online { .. } => PlayMode::Online,
            LoadStrategy::Web { .. } => PlayMode::Web,
        }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, LoadStrategy::Simulate { .. })
    }

    /// Locate the bytes of `info`, downloading them when the mode allows.
    pub async fn resolve(&self, info: &BundleInfo) -> Result<BundleLocation> {
        match self {
            LoadStrategy::Simulate { .. } => Err(AssetError::BundleNotFound(format!(
                "{} (bundles are not used in simulate mode)",
                info.bundle_name
            ))),
            LoadStrategy::Offline {
                cache,
                streaming_path,
            } => local_location(cache, streaming_path, info)
                .ok_or_else(|| AssetError::BundleNotFound(info.bundle_name.clone())),
            LoadStrategy::Online {
                cache,
                streaming_path,
                downloads,
            } => {
                if let Some(location) = local_location(cache, streaming_path, info) {
                    return Ok(location);
                }
                debug!("bundle {} not cached, downloading", info.bundle_name);
                downloads
                    .download(std::slice::from_ref(info), None, None)
                    .await?;
                Ok(BundleLocation::File(cache.cache_path(info)))
            }
            LoadStrategy::Web {
                base_url,
                timeout,
                source,
                memory,
            } => {
                let file_name = info.file_name();
                if let Some(bytes) = memory.lock().get(&file_name) {
                    return Ok(BundleLocation::Memory(bytes.clone()));
                }

                let url = format!("{}{}", base_url, file_name);
                let bytes = source
                    .fetch(&url, *timeout)
                    .await
                    .map_err(|e| AssetError::transfer(&url, e))?;
                if info.crc != 0 {
                    let actual = crc32_bytes(&bytes);
                    if actual != info.crc {
                        return Err(AssetError::HashMismatch {
                            file: file_name,
                            expected: info.crc,
                            actual,
                        });
                    }
                }
                memory.lock().insert(file_name, bytes.clone());
                Ok(BundleLocation::Memory(bytes))
            }
        }
    }

    /// Read an asset's source file in simulate mode.
    pub async fn read_source(&self, asset_path: &str) -> Result<Bytes> {
        let LoadStrategy::Simulate { root } = self else {
            return Err(AssetError::AssetNotFound(format!(
                "{} (source files are only read in simulate mode)",
                asset_path
            )));
        };
        let relative = Path::new(asset_path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(AssetError::AssetNotFound(asset_path.to_string()));
        }
        match tokio::fs::read(root.join(relative)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AssetError::AssetNotFound(asset_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop bundles held in memory by the web strategy.
    pub fn clear_memory(&self) {
        if let LoadStrategy::Web { memory, .. } = self {
            memory.lock().clear();
        }
    }
}

fn local_location(
    cache: &CacheIndex,
    streaming_path: &Path,
    info: &BundleInfo,
) -> Option<BundleLocation> {
    if cache.validate(info) {
        return Some(BundleLocation::File(cache.cache_path(info)));
    }
    let shipped = streaming_path.join(info.file_name());
    if shipped.is_file() {
        return Some(BundleLocation::File(shipped));
    }
    None
}
