// Local/remote version reconciliation and download planning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::version::{UpdateCheckResult, UpdateStatus, VersionInfo};
use crate::cache::CacheIndex;
use crate::config::{EngineConfig, PlayMode};
use crate::error::{AssetError, Result};
use crate::manifest::{BundleInfo, BundleManifest};
use crate::source::RemoteSource;

#[derive(Default)]
struct ResolverState {
    local_version: Option<VersionInfo>,
    remote_version: Option<VersionInfo>,
    local_manifest: Option<Arc<BundleManifest>>,
    remote_manifest: Option<Arc<BundleManifest>>,
}

pub struct VersionResolver {
    play_mode: PlayMode,
    persistent_dir: PathBuf,
    streaming_path: PathBuf,
    base_url: String,
    version_file_name: String,
    manifest_file_name: String,
    timeout: Duration,
    source: Arc<dyn RemoteSource>,
    cache: CacheIndex,
    state: RwLock<ResolverState>,
}

impl VersionResolver {
    pub fn new(config: &EngineConfig, source: Arc<dyn RemoteSource>, cache: CacheIndex) -> Self {
        Self {
            play_mode: config.play_mode,
            persistent_dir: config.persistent_dir(),
            streaming_path: config.streaming_path(),
            base_url: config.remote_base_url(),
            version_file_name: config.version_file_name.clone(),
            manifest_file_name: config.manifest_file_name.clone(),
            timeout: config.metadata_timeout(),
            source,
            cache,
            state: RwLock::new(ResolverState::default()),
        }
    }

    /// Read the local version and, when online, the remote one.
    pub async fn initialize(&self) {
        let local = self.load_local_version().await;
        self.state.write().local_version = local;

        if self.play_mode == PlayMode::Online {
            match self.fetch_remote_version().await {
                Ok(remote) => self.state.write().remote_version = Some(remote),
                Err(e) => warn!("failed to load remote version: {}", e),
            }
        }

        let state = self.state.read();
        info!(
            "version initialized local={:?} remote={:?}",
            state.local_version.as_ref().map(|v| v.version.as_str()),
            state.remote_version.as_ref().map(|v| v.version.as_str())
        );
    }

    pub fn local_version(&self) -> Option<VersionInfo> {
        self.state.read().local_version.clone()
    }

    pub fn remote_version(&self) -> Option<VersionInfo> {
        self.state.read().remote_version.clone()
    }

    /// A remote version is known and differs from the local one.
    pub fn has_new_version(&self) -> bool {
        let state = self.state.read();
        match &state.remote_version {
            Some(remote) => {
                state.local_version.as_ref().map(|l| &l.version) != Some(&remote.version)
            }
            None => false,
        }
    }

    /// Compare the local version with a freshly fetched remote version.
    pub async fn check_update(&self) -> UpdateCheckResult {
        let local_version = self.local_version().map(|v| v.version);

        let remote = match self.fetch_remote_version().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("update check failed: {}", e);
                return UpdateCheckResult::failed(local_version, e);
            }
        };
        self.state.write().remote_version = Some(remote.clone());

        if local_version.as_deref() == Some(remote.version.as_str()) {
            return UpdateCheckResult {
                status: UpdateStatus::NoUpdate,
                local_version,
                remote_version: Some(remote.version),
                download_size: 0,
                download_count: 0,
                error: None,
            };
        }

        let status = if remote.force_update {
            UpdateStatus::ForceUpdate
        } else {
            UpdateStatus::OptionalUpdate
        };

        let manifest = match self.fetch_remote_manifest(&remote).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("update check could not fetch manifest: {}", e);
                let mut failed = UpdateCheckResult::failed(local_version, e);
                failed.remote_version = Some(remote.version);
                return failed;
            }
        };
        let plan = self.get_bundles_to_download::<&str>(&[], Some(manifest.as_ref()));

        info!(
            "update available local={:?} remote={} status={:?} files={}",
            local_version,
            remote.version,
            status,
            plan.len()
        );
        UpdateCheckResult {
            status,
            local_version,
            remote_version: Some(remote.version),
            download_size: plan.iter().map(|b| b.size).sum(),
            download_count: plan.len(),
            error: None,
        }
    }

    /// Bundles that are neither validated by the cache nor shipped in the
    /// streaming path. `tags` narrows the candidates; empty means all bundles.
    /// Without an explicit manifest the remote one is used, else the local one.
    pub fn get_bundles_to_download<S: AsRef<str>>(
        &self,
        tags: &[S],
        manifest: Option<&BundleManifest>,
    ) -> Vec<BundleInfo> {
        let fallback = {
            let state = self.state.read();
            state
                .remote_manifest
                .clone()
                .or_else(|| state.local_manifest.clone())
        };
        let Some(manifest) = manifest.or(fallback.as_deref()) else {
            return Vec::new();
        };

        let candidates: Vec<&BundleInfo> = if tags.is_empty() {
            manifest.bundles().iter().collect()
        } else {
            manifest.bundles_by_tags(tags)
        };

        candidates
            .into_iter()
            .filter(|bundle| !self.cache.validate(bundle))
            .filter(|bundle| !self.streaming_path.join(bundle.file_name()).is_file())
            .cloned()
            .collect()
    }

    pub fn get_download_size<S: AsRef<str>>(&self, tags: &[S]) -> u64 {
        self.get_bundles_to_download(tags, None)
            .iter()
            .map(|b| b.size)
            .sum()
    }

    /// Resolve the manifest for this session.
    ///
    /// Online with a newer remote version, the remote manifest is fetched and
    /// persisted together with its version document. Any failure there falls
    /// back to the local manifest (persistent dir, then streaming path).
    pub async fn load_manifest(&self) -> Result<Arc<BundleManifest>> {
        let remote = self.remote_version();
        if self.play_mode == PlayMode::Online && self.has_new_version() {
            if let Some(remote) = remote {
                match self.refresh_from_remote(&remote).await {
                    Ok(manifest) => return Ok(manifest),
                    Err(e) => warn!("failed to refresh manifest, using local copy: {}", e),
                }
            }
        }

        match self.load_local_manifest().await {
            Some(manifest) => {
                let manifest = Arc::new(manifest);
                self.state.write().local_manifest = Some(Arc::clone(&manifest));
                Ok(manifest)
            }
            None if self.play_mode == PlayMode::Simulate => {
                debug!("no manifest found, simulate mode continues with an empty one");
                let manifest = Arc::new(BundleManifest::default());
                self.state.write().local_manifest = Some(Arc::clone(&manifest));
                Ok(manifest)
            }
            None => Err(AssetError::ManifestUnavailable(format!(
                "no {} in {} or {}",
                self.manifest_file_name,
                self.persistent_dir.display(),
                self.streaming_path.display()
            ))),
        }
    }

    async fn refresh_from_remote(&self, remote: &VersionInfo) -> Result<Arc<BundleManifest>> {
        let manifest = self.fetch_remote_manifest(remote).await?;

        tokio::fs::create_dir_all(&self.persistent_dir).await?;
        tokio::fs::write(
            self.persistent_dir.join(&self.manifest_file_name),
            manifest.to_json()?,
        )
        .await?;
        tokio::fs::write(
            self.persistent_dir.join(&self.version_file_name),
            remote.to_json()?,
        )
        .await?;

        let mut state = self.state.write();
        state.local_manifest = Some(Arc::clone(&manifest));
        state.local_version = Some(remote.clone());
        info!("manifest updated to version {}", remote.version);
        Ok(manifest)
    }

    async fn fetch_remote_version(&self) -> Result<VersionInfo> {
        let url = format!("{}{}", self.base_url, self.version_file_name);
        let bytes = self
            .source
            .fetch(&url, self.timeout)
            .await
            .map_err(|e| AssetError::transfer(&url, e))?;
        VersionInfo::from_json(&String::from_utf8_lossy(&bytes))
    }

    async fn fetch_remote_manifest(&self, remote: &VersionInfo) -> Result<Arc<BundleManifest>> {
        {
            let state = self.state.read();
            if let Some(cached) = &state.remote_manifest {
                if cached.version() == remote.version {
                    return Ok(Arc::clone(cached));
                }
            }
        }

        let url = format!("{}{}", self.base_url, self.manifest_file_name);
        let bytes = self
            .source
            .fetch(&url, self.timeout)
            .await
            .map_err(|e| AssetError::transfer(&url, e))?;
        if remote.manifest_size > 0 && bytes.len() as u64 != remote.manifest_size {
            return Err(AssetError::ManifestUnavailable(format!(
                "remote manifest is {} bytes, version document says {}",
                bytes.len(),
                remote.manifest_size
            )));
        }

        let manifest = Arc::new(BundleManifest::from_json(&String::from_utf8_lossy(&bytes))?);
        self.state.write().remote_manifest = Some(Arc::clone(&manifest));
        Ok(manifest)
    }

    async fn load_local_version(&self) -> Option<VersionInfo> {
        for dir in [&self.persistent_dir, &self.streaming_path] {
            let path = dir.join(&self.version_file_name);
            if let Some(json) = read_optional(&path).await {
                match VersionInfo::from_json(&json) {
                    Ok(version) => return Some(version),
                    Err(e) => warn!("ignoring {}: {}", path.display(), e),
                }
            }
        }
        None
    }

    async fn load_local_manifest(&self) -> Option<BundleManifest> {
        for dir in [&self.persistent_dir, &self.streaming_path] {
            let path = dir.join(&self.manifest_file_name);
            if let Some(json) = read_optional(&path).await {
                match BundleManifest::from_json(&json) {
                    Ok(manifest) => return Some(manifest),
                    Err(e) => warn!("ignoring {}: {}", path.display(), e),
                }
            }
        }
        None
    }
}

async fn read_optional(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => Some(json),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("failed to read {}: {}", path.display(), e);
            None
        }
    }
}
