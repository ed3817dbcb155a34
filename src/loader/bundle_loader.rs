// Resident/in-flight bundle tables and asset tracking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::asset::Asset;
use super::backend::{BundleBackend, BundleLocation};
use super::strategy::LoadStrategy;
use crate::error::{AssetError, Result};
use crate::handle::{
    AssetHandle, BundleHandle, BundleRef, BundleSnapshot, TrackedAsset, WeakBundle,
};
use crate::manifest::BundleManifest;

type LoadOutcome = std::result::Result<Arc<BundleHandle>, AssetError>;
type SharedLoad = Shared<BoxFuture<'static, LoadOutcome>>;

struct InFlight {
    id: u64,
    load: SharedLoad,
}

struct Resident {
    /// Registration order; dependencies always register before dependents.
    seq: u64,
    handle: Arc<BundleHandle>,
}

struct TrackedEntry {
    handle: Arc<dyn TrackedAsset>,
    bundle_name: Option<String>,
    /// Keeps the owning bundle resident while the asset is tracked.
    _bundle: Option<BundleRef>,
}

#[derive(Default)]
struct LoaderState {
    resident: HashMap<String, Resident>,
    in_flight: HashMap<String, InFlight>,
    assets: HashMap<String, TrackedEntry>,
}

struct LoaderInner {
    manifest: RwLock<Arc<BundleManifest>>,
    strategy: LoadStrategy,
    backend: Arc<dyn BundleBackend>,
    state: Mutex<LoaderState>,
    next_id: AtomicU64,
}

/// Tracked asset as reported by [`BundleLoader::tracked_assets`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSnapshot {
    pub path: String,
    pub type_name: &'static str,
    pub bundle_name: Option<String>,
    pub ref_count: u32,
}

/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct BundleLoader {
    inner: Arc<LoaderInner>,
}

impl BundleLoader {
    pub fn new(
        manifest: Arc<BundleManifest>,
        strategy: LoadStrategy,
        backend: Arc<dyn BundleBackend>,
    ) -> Self {
        info!("bundle loader ready mode={:?}", strategy.mode());
        Self {
            inner: Arc::new(LoaderInner {
                manifest: RwLock::new(manifest),
                strategy,
                backend,
                state: Mutex::new(LoaderState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn manifest(&self) -> Arc<BundleManifest> {
        self.inner.manifest()
    }

    /// Swap in a new manifest. Resident bundles stay loaded.
    pub fn set_manifest(&self, manifest: Arc<BundleManifest>) {
        *self.inner.manifest.write() = manifest;
    }

    pub fn strategy(&self) -> &LoadStrategy {
        &self.inner.strategy
    }

    /// Load `bundle_name` and its dependencies, returning a strong reference.
    ///
    /// A resident bundle is retained instead of reloaded, and concurrent
    /// requests for the same name share one physical load.
    pub async fn load_bundle(&self, bundle_name: &str) -> Result<BundleRef> {
        Arc::clone(&self.inner)
            .load_bundle_chain(bundle_name.to_string(), Vec::new())
            .await
    }

    pub async fn load_asset<T: Asset>(&self, path: &str) -> Result<Arc<AssetHandle<T>>> {
        if let Some(existing) = self.retain_tracked::<T>(path)? {
            return Ok(existing);
        }

        let start = Instant::now();
        if self.inner.strategy.is_simulated() {
            let data = self.inner.strategy.read_source(path).await?;
            let asset = T::from_source(path, data).map_err(|e| decode_error(path, e))?;
            let handle = AssetHandle::new(path, asset, None, start.elapsed());
            return self.track(handle, None);
        }

        let bundle_name = self
            .manifest()
            .bundle_name_for_asset(path)
            .map(str::to_string)
            .ok_or_else(|| AssetError::AssetNotFound(path.to_string()))?;

        let bundle = self.load_bundle(&bundle_name).await?;
        let native = bundle
            .native()
            .ok_or_else(|| AssetError::DisposedHandle(bundle_name.clone()))?;
        let asset = T::decode(&native, path).map_err(|e| decode_error(path, e))?;

        let handle = AssetHandle::new(path, asset, Some(bundle_name), start.elapsed());
        debug!("asset {} loaded in {:?}", path, handle.load_time());
        self.track(handle, Some(bundle))
    }

    /// Load several assets concurrently; each path succeeds or fails on its own.
    pub async fn load_assets<T: Asset>(&self, paths: &[&str]) -> Vec<Result<Arc<AssetHandle<T>>>> {
        futures::future::join_all(paths.iter().map(|p| self.load_asset::<T>(p))).await
    }

    /// Bytes of a raw-file bundle. Nothing is retained.
    pub async fn load_raw_file(&self, path: &str) -> Result<Bytes> {
        let strategy = &self.inner.strategy;
        if strategy.is_simulated() {
            return strategy.read_source(path).await;
        }

        let info = self
            .manifest()
            .bundle_for_asset(path)
            .cloned()
            .ok_or_else(|| AssetError::AssetNotFound(path.to_string()))?;
        if !info.is_raw_file {
            return Err(AssetError::NotRawFile(path.to_string()));
        }

        match strategy.resolve(&info).await? {
            BundleLocation::Memory(bytes) => Ok(bytes),
            BundleLocation::File(file) => Ok(Bytes::from(tokio::fs::read(&file).await?)),
        }
    }

    pub async fn load_raw_text(&self, path: &str) -> Result<String> {
        let bytes = self.load_raw_file(path).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| decode_error(path, e))
    }

    /// Release one reference to `handle`; a handle released to zero stops
    /// being tracked and unpins its bundle.
    pub fn release<T: Send + Sync + 'static>(&self, handle: &Arc<AssetHandle<T>>) {
        if handle.release() {
            self.untrack_if_disposed(handle.path());
        }
    }

    /// Release one reference to whatever is tracked under `path`.
    pub fn release_path(&self, path: &str) -> bool {
        let handle = self
            .inner
            .state
            .lock()
            .assets
            .get(path)
            .map(|e| Arc::clone(&e.handle));
        match handle {
            Some(handle) => {
                if handle.release() {
                    self.untrack_if_disposed(path);
                }
                true
            }
            None => false,
        }
    }

    /// Drop disposed assets, then unload bundles nobody references.
    pub fn unload_unused(&self) -> usize {
        let mut state = self.inner.state.lock();

        let stale: Vec<String> = state
            .assets
            .iter()
            .filter(|(_, e)| !e.handle.is_valid())
            .map(|(p, _)| p.clone())
            .collect();
        for path in &stale {
            state.assets.remove(path);
        }

        // Finished loads nobody picked up.
        let settled: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.load.peek().is_some())
            .map(|(n, _)| n.clone())
            .collect();
        for name in settled {
            if let Some(flight) = state.in_flight.remove(&name) {
                if let Some(Ok(handle)) = flight.load.peek() {
                    if handle.ref_count() == 0 {
                        handle.dispose();
                    }
                }
            }
        }

        let mut unloaded = 0;
        let unused: Vec<String> = state
            .resident
            .iter()
            .filter(|(_, r)| r.handle.ref_count() == 0)
            .map(|(n, _)| n.clone())
            .collect();
        for name in unused {
            if let Some(resident) = state.resident.remove(&name) {
                if !resident.handle.is_disposed() {
                    resident.handle.dispose();
                    unloaded += 1;
                }
            }
        }

        if unloaded > 0 || !stale.is_empty() {
            info!(
                "unload unused assets={} bundles={}",
                stale.len(),
                unloaded
            );
        }
        unloaded
    }

    /// Dispose every tracked asset and every resident bundle.
    pub fn force_unload_all(&self) {
        let (assets, mut residents) = {
            let mut state = self.inner.state.lock();
            state.in_flight.clear();
            let assets: Vec<TrackedEntry> = state.assets.drain().map(|(_, e)| e).collect();
            let residents: Vec<Resident> = state.resident.drain().map(|(_, r)| r).collect();
            (assets, residents)
        };

        for entry in &assets {
            entry.handle.dispose();
        }
        drop(assets);

        // Dependents first.
        residents.sort_by(|a, b| b.seq.cmp(&a.seq));
        for resident in &residents {
            resident.handle.dispose();
        }
        self.inner.strategy.clear_memory();
        info!("force unloaded {} bundles", residents.len());
    }

    /// Dispose `bundle_name` and every tracked asset loaded from it.
    pub fn force_unload_bundle(&self, bundle_name: &str) -> bool {
        let (assets, resident) = {
            let mut state = self.inner.state.lock();
            let paths: Vec<String> = state
                .assets
                .iter()
                .filter(|(_, e)| e.bundle_name.as_deref() == Some(bundle_name))
                .map(|(p, _)| p.clone())
                .collect();
            let assets: Vec<TrackedEntry> = paths
                .iter()
                .filter_map(|p| state.assets.remove(p))
                .collect();
            (assets, state.resident.remove(bundle_name))
        };

        for entry in &assets {
            entry.handle.dispose();
        }
        drop(assets);

        match resident {
            Some(resident) => {
                resident.handle.dispose();
                info!("force unloaded bundle {}", bundle_name);
                true
            }
            None => false,
        }
    }

    pub fn is_resident(&self, bundle_name: &str) -> bool {
        self.inner
            .state
            .lock()
            .resident
            .get(bundle_name)
            .map(|r| !r.handle.is_disposed())
            .unwrap_or(false)
    }

    /// Snapshots of the resident table, sorted by bundle name.
    pub fn inspect(&self) -> Vec<BundleSnapshot> {
        let mut snapshots: Vec<BundleSnapshot> = self
            .inner
            .state
            .lock()
            .resident
            .values()
            .map(|r| r.handle.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.bundle_name.cmp(&b.bundle_name));
        snapshots
    }

    /// Non-owning observers of every resident bundle.
    pub fn observe(&self) -> Vec<WeakBundle> {
        self.inner
            .state
            .lock()
            .resident
            .values()
            .map(|r| r.handle.downgrade())
            .collect()
    }

    pub fn tracked_assets(&self) -> Vec<AssetSnapshot> {
        let mut assets: Vec<AssetSnapshot> = self
            .inner
            .state
            .lock()
            .assets
            .iter()
            .map(|(path, e)| AssetSnapshot {
                path: path.clone(),
                type_name: e.handle.type_name(),
                bundle_name: e.bundle_name.clone(),
                ref_count: e.handle.ref_count(),
            })
            .collect();
        assets.sort_by(|a, b| a.path.cmp(&b.path));
        assets
    }

    fn retain_tracked<T: Asset>(&self, path: &str) -> Result<Option<Arc<AssetHandle<T>>>> {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.assets.get(path) else {
            return Ok(None);
        };
        if !entry.handle.is_valid() {
            state.assets.remove(path);
            return Ok(None);
        }

        let loaded = entry.handle.type_name();
        let Ok(typed) = Arc::clone(&entry.handle).into_any().downcast::<AssetHandle<T>>() else {
            return Err(AssetError::TypeMismatch {
                path: path.to_string(),
                loaded,
                requested: T::type_name(),
            });
        };
        if !typed.retain() {
            state.assets.remove(path);
            return Ok(None);
        }
        debug!("asset {} reused", path);
        Ok(Some(typed))
    }

    fn track<T: Asset>(
        &self,
        handle: Arc<AssetHandle<T>>,
        bundle: Option<BundleRef>,
    ) -> Result<Arc<AssetHandle<T>>> {
        let path = handle.path().to_string();
        let mut state = self.inner.state.lock();

        // A concurrent load of the same path may have finished first.
        if let Some(existing) = state.assets.get(&path) {
            if existing.handle.is_valid() {
                let existing = Arc::clone(&existing.handle);
                drop(state);
                handle.dispose();
                drop(bundle);
                let loaded = existing.type_name();
                let typed = existing
                    .into_any()
                    .downcast::<AssetHandle<T>>()
                    .map_err(|_| AssetError::TypeMismatch {
                        path: path.clone(),
                        loaded,
                        requested: T::type_name(),
                    })?;
                if typed.retain() {
                    return Ok(typed);
                }
                return Err(AssetError::DisposedHandle(path));
            }
        }

        state.assets.insert(
            path,
            TrackedEntry {
                handle: Arc::clone(&handle) as Arc<dyn TrackedAsset>,
                bundle_name: handle.bundle_name().map(str::to_string),
                _bundle: bundle,
            },
        );
        Ok(handle)
    }

    fn untrack_if_disposed(&self, path: &str) {
        let removed = {
            let mut state = self.inner.state.lock();
            match state.assets.get(path) {
                Some(entry) if !entry.handle.is_valid() => state.assets.remove(path),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            debug!("asset {} released", path);
            drop(entry);
        }
    }
}

impl LoaderInner {
    fn manifest(&self) -> Arc<BundleManifest> {
        Arc::clone(&self.manifest.read())
    }

    fn load_bundle_chain(
        self: Arc<Self>,
        name: String,
        chain: Vec<String>,
    ) -> BoxFuture<'static, Result<BundleRef>> {
        async move {
            if chain.contains(&name) {
                let mut cycle = chain;
                cycle.push(name);
                warn!("dependency cycle {}", cycle.join(" -> "));
                return Err(AssetError::DependencyCycle(cycle));
            }

            loop {
                let (id, load) = {
                    let mut state = self.state.lock();
                    if let Some(resident) = state.resident.get(&name) {
                        if let Some(strong) = resident.handle.acquire() {
                            debug!("bundle {} resident, retained", name);
                            return Ok(strong);
                        }
                        state.resident.remove(&name);
                    }
                    match state.in_flight.get(&name) {
                        Some(flight) => (flight.id, flight.load.clone()),
                        None => {
                            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                            let load = Arc::clone(&self)
                                .physical_load(name.clone(), chain.clone())
                                .boxed()
                                .shared();
                            state.in_flight.insert(
                                name.clone(),
                                InFlight {
                                    id,
                                    load: load.clone(),
                                },
                            );
                            // Runs to completion even if every requester goes away.
                            tokio::spawn(load.clone());
                            (id, load)
                        }
                    }
                };

                let outcome = load.await;

                // Registration and the first retain happen under one lock.
                let acquired = {
                    let mut state = self.state.lock();
                    if state.in_flight.get(&name).map(|f| f.id) == Some(id) {
                        state.in_flight.remove(&name);
                        if let Ok(handle) = &outcome {
                            let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
                            state.resident.insert(
                                name.clone(),
                                Resident {
                                    seq,
                                    handle: Arc::clone(handle),
                                },
                            );
                        }
                    }
                    outcome?.acquire()
                };
                if let Some(strong) = acquired {
                    return Ok(strong);
                }
                // Disposed between load completion and this retain; go again.
                debug!("bundle {} disposed before retain, reloading", name);
            }
        }
        .boxed()
    }

    async fn physical_load(self: Arc<Self>, name: String, chain: Vec<String>) -> LoadOutcome {
        let info = self
            .manifest()
            .bundle(&name)
            .cloned()
            .ok_or_else(|| AssetError::BundleNotFound(name.clone()))?;
        let start = Instant::now();

        let mut dep_chain = chain;
        dep_chain.push(name.clone());
        let mut dependencies = Vec::with_capacity(info.dependencies.len());
        for dep in &info.dependencies {
            // Dropping `dependencies` on error releases what was already retained.
            let strong = Arc::clone(&self)
                .load_bundle_chain(dep.clone(), dep_chain.clone())
                .await?;
            dependencies.push(strong);
        }

        let location = self.strategy.resolve(&info).await?;
        let native = self
            .backend
            .load(&info, location)
            .await
            .map_err(|e| AssetError::Decode {
                path: name.clone(),
                message: e.to_string(),
            })?;

        let handle = BundleHandle::new(
            info,
            native,
            dependencies,
            Arc::clone(&self.backend),
            start.elapsed(),
        );
        info!("bundle {} loaded in {:?}", name, handle.load_time());
        Ok(handle)
    }
}

fn decode_error(path: &str, err: impl std::fmt::Display) -> AssetError {
    AssetError::Decode {
        path: path.to_string(),
        message: err.to_string(),
    }
}
