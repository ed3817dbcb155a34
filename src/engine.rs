// The engine context handed to UI and gameplay layers.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cache::CacheIndex;
use crate::config::{EngineConfig, PlayMode};
use crate::download::{DownloadManager, DownloadProgress, DownloadReport, DownloadSettings};
use crate::error::Result;
use crate::handle::{AssetHandle, BundleSnapshot};
use crate::loader::{Asset, BundleBackend, BundleLoader, LoadStrategy};
use crate::manifest::{BundleInfo, BundleManifest};
use crate::preload::{PreloadManager, PreloadSettings};
use crate::source::{HttpSource, RemoteSource};
use crate::update::{UpdateCheckResult, VersionResolver};

/// Owns every subsystem for one session. Dropping it unloads everything and
/// stops running downloads and preloads.
pub struct AssetEngine {
    config: EngineConfig,
    cache: CacheIndex,
    downloads: Arc<DownloadManager>,
    resolver: VersionResolver,
    loader: BundleLoader,
    preloader: PreloadManager,
}

impl AssetEngine {
    /// Build the engine against the configured HTTP origin.
    pub async fn initialize(config: EngineConfig, backend: Arc<dyn BundleBackend>) -> Result<Self> {
        let source = Arc::new(HttpSource::new(config.headers.clone()));
        Self::with_source(config, source, backend).await
    }

    pub async fn with_source(
        config: EngineConfig,
        source: Arc<dyn RemoteSource>,
        backend: Arc<dyn BundleBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = CacheIndex::from_config(&config)?;
        let downloads = Arc::new(DownloadManager::new(
            Arc::clone(&source),
            cache.clone(),
            DownloadSettings::from_config(&config),
        ));

        let resolver = VersionResolver::new(&config, Arc::clone(&source), cache.clone());
        resolver.initialize().await;
        let manifest = resolver.load_manifest().await?;

        let strategy =
            LoadStrategy::from_config(&config, cache.clone(), source, Arc::clone(&downloads));
        let loader = BundleLoader::new(Arc::clone(&manifest), strategy, backend);
        let preloader =
            PreloadManager::new(loader.clone(), PreloadSettings::from_config(&config));

        info!(
            "asset engine initialized mode={:?} platform={} version={} bundles={}",
            config.play_mode,
            config.platform,
            manifest.version(),
            manifest.bundles().len()
        );

        Ok(Self {
            config,
            cache,
            downloads,
            resolver,
            loader,
            preloader,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manifest(&self) -> Arc<BundleManifest> {
        self.loader.manifest()
    }

    pub fn cache(&self) -> &CacheIndex {
        &self.cache
    }

    pub fn loader(&self) -> &BundleLoader {
        &self.loader
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    pub fn preloader(&self) -> &PreloadManager {
        &self.preloader
    }

    pub async fn load_asset<T: Asset>(&self, path: &str) -> Result<Arc<AssetHandle<T>>> {
        self.loader.load_asset(path).await
    }

    pub async fn load_assets<T: Asset>(&self, paths: &[&str]) -> Vec<Result<Arc<AssetHandle<T>>>> {
        self.loader.load_assets(paths).await
    }

    pub async fn load_raw_file(&self, path: &str) -> Result<Bytes> {
        self.loader.load_raw_file(path).await
    }

    pub async fn load_raw_text(&self, path: &str) -> Result<String> {
        self.loader.load_raw_text(path).await
    }

    pub fn release<T: Send + Sync + 'static>(&self, handle: &Arc<AssetHandle<T>>) {
        self.loader.release(handle);
    }

    pub fn release_path(&self, path: &str) -> bool {
        self.loader.release_path(path)
    }

    pub fn unload_unused(&self) -> usize {
        self.loader.unload_unused()
    }

    /// Unload everything, preloaded bundles included.
    pub fn force_unload_all(&self) {
        self.preloader.cancel_all();
        self.preloader.release_all();
        self.loader.force_unload_all();
    }

    pub fn force_unload_bundle(&self, bundle_name: &str) -> bool {
        self.loader.force_unload_bundle(bundle_name)
    }

    pub fn inspect(&self) -> Vec<BundleSnapshot> {
        self.loader.inspect()
    }

    /// Bundles of the current manifest still missing locally. `tags` narrows
    /// the set; empty means the whole manifest.
    pub fn bundles_to_download<S: AsRef<str>>(&self, tags: &[S]) -> Vec<BundleInfo> {
        if self.config.play_mode != PlayMode::Online {
            return Vec::new();
        }
        let manifest = self.manifest();
        self.resolver.get_bundles_to_download(tags, Some(manifest.as_ref()))
    }

    pub fn get_download_size<S: AsRef<str>>(&self, tags: &[S]) -> u64 {
        self.bundles_to_download(tags).iter().map(|b| b.size).sum()
    }

    /// Download every missing bundle carrying any of `tags` (all when empty).
    pub async fn download<S: AsRef<str>>(
        &self,
        tags: &[S],
        progress: Option<&watch::Sender<DownloadProgress>>,
    ) -> Result<DownloadReport> {
        if self.config.play_mode != PlayMode::Online {
            debug!("download skipped in {:?} mode", self.config.play_mode);
            if let Some(tx) = progress {
                tx.send_replace(DownloadProgress::default());
            }
            return Ok(DownloadReport::default());
        }
        let plan = self.bundles_to_download(tags);
        self.downloads.download(&plan, progress, None).await
    }

    pub fn cancel_downloads(&self) {
        self.downloads.cancel_all();
    }

    pub fn pause_downloads(&self) {
        self.downloads.pause();
    }

    pub fn resume_downloads(&self) {
        self.downloads.resume();
    }

    pub async fn check_update(&self) -> UpdateCheckResult {
        self.resolver.check_update().await
    }

    /// Reload the manifest (refreshing it from the origin when a newer version
    /// is known) and hand it to the loader.
    pub async fn apply_update(&self) -> Result<Arc<BundleManifest>> {
        let manifest = self.resolver.load_manifest().await?;
        self.loader.set_manifest(Arc::clone(&manifest));
        info!("manifest {} applied", manifest.version());
        Ok(manifest)
    }
}

impl Drop for AssetEngine {
    fn drop(&mut self) {
        self.downloads.cancel_all();
        self.force_unload_all();
        debug!("asset engine dropped");
    }
}
