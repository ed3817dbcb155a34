// Priority-ordered preloading on top of the bundle loader.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::predictor::PreloadPredictor;
use crate::config::EngineConfig;
use crate::error::{AssetError, Result};
use crate::handle::BundleRef;
use crate::loader::BundleLoader;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PreloadPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadEvent {
    Preloaded(String),
    Failed { path: String, error: AssetError },
}

#[derive(Debug, Clone)]
pub struct PreloadSettings {
    pub enabled: bool,
    pub max_tasks: usize,
}

impl PreloadSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            enabled: config.enable_preload,
            max_tasks: config.max_preload_tasks.max(1),
        }
    }
}

struct Queued {
    priority: PreloadPriority,
    id: u64,
    path: String,
}

// Highest priority first, then oldest request first.
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Queued {}

struct Request {
    id: u64,
    token: CancellationToken,
    running: bool,
}

#[derive(Default)]
struct PreloadState {
    queue: BinaryHeap<Queued>,
    /// Queued or running requests by asset path.
    requests: HashMap<String, Request>,
    running: usize,
    /// Pins keeping each preloaded asset's bundle resident. Simulated assets
    /// have nothing to pin.
    preloaded: HashMap<String, Option<BundleRef>>,
    paused: bool,
}

struct PreloadInner {
    loader: BundleLoader,
    settings: PreloadSettings,
    state: Mutex<PreloadState>,
    predictor: Mutex<PreloadPredictor>,
    wake: Notify,
    shutdown: CancellationToken,
    events: broadcast::Sender<PreloadEvent>,
    next_id: AtomicU64,
}

/// Loads requested assets' bundles in the background, highest priority first,
/// with at most `max_tasks` loads running at once. A preloaded bundle stays
/// resident until [`PreloadManager::release`] or [`PreloadManager::release_all`].
pub struct PreloadManager {
    inner: Arc<PreloadInner>,
}

impl PreloadManager {
    pub fn new(loader: BundleLoader, settings: PreloadSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(PreloadInner {
            loader,
            settings,
            state: Mutex::new(PreloadState::default()),
            predictor: Mutex::new(PreloadPredictor::new()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            events,
            next_id: AtomicU64::new(1),
        });

        if inner.settings.enabled {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(Arc::clone(&inner).dispatch());
                }
                Err(_) => warn!("no runtime, preloading disabled"),
            }
        }
        Self { inner }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.settings.enabled
    }

    /// Queue `path` for preloading. Returns `false` when preloading is
    /// disabled or the asset is already preloaded or queued.
    pub fn request(&self, path: &str, priority: PreloadPriority) -> bool {
        if !self.inner.settings.enabled || path.is_empty() {
            return false;
        }
        {
            let mut state = self.inner.state.lock();
            if state.preloaded.contains_key(path) || state.requests.contains_key(path) {
                return false;
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            state.requests.insert(
                path.to_string(),
                Request {
                    id,
                    token: self.inner.shutdown.child_token(),
                    running: false,
                },
            );
            state.queue.push(Queued {
                priority,
                id,
                path: path.to_string(),
            });
        }
        debug!("preload {} queued priority={:?}", path, priority);
        self.inner.wake.notify_one();
        true
    }

    /// Queue several paths at one priority; returns how many were accepted.
    pub fn request_many<S: AsRef<str>>(&self, paths: &[S], priority: PreloadPriority) -> usize {
        paths
            .iter()
            .filter(|p| self.request(p.as_ref(), priority))
            .count()
    }

    /// Drop a queued request or stop a running one.
    pub fn cancel(&self, path: &str) -> bool {
        let removed = self.inner.state.lock().requests.remove(path);
        match removed {
            Some(request) => {
                request.token.cancel();
                debug!("preload {} cancelled", path);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let requests: Vec<Request> = {
            let mut state = self.inner.state.lock();
            state.queue.clear();
            state.requests.drain().map(|(_, r)| r).collect()
        };
        for request in &requests {
            request.token.cancel();
        }
        info!("preload cancelled {} requests", requests.len());
    }

    /// Hold queued requests. Running preloads finish normally.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.inner.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .requests
            .values()
            .filter(|r| !r.running)
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().running
    }

    pub fn preloaded_count(&self) -> usize {
        self.inner.state.lock().preloaded.len()
    }

    pub fn is_preloaded(&self, path: &str) -> bool {
        self.inner.state.lock().preloaded.contains_key(path)
    }

    /// Unpin one preloaded asset. Its bundle unloads once nothing else holds it.
    pub fn release(&self, path: &str) -> bool {
        let pin = self.inner.state.lock().preloaded.remove(path);
        pin.is_some()
    }

    pub fn release_all(&self) {
        let pins: Vec<Option<BundleRef>> = {
            let mut state = self.inner.state.lock();
            state.preloaded.drain().map(|(_, pin)| pin).collect()
        };
        if !pins.is_empty() {
            debug!("released {} preloaded assets", pins.len());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreloadEvent> {
        self.inner.events.subscribe()
    }

    /// Feed the predictor behind [`Self::predicted_assets`].
    pub fn record_access(&self, path: &str) {
        self.inner.predictor.lock().record_access(path);
    }

    pub fn predicted_assets(&self, current: &str, max_count: usize) -> Vec<String> {
        self.inner.predictor.lock().predict(current, max_count)
    }
}

impl Drop for PreloadManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.release_all();
    }
}

impl PreloadInner {
    async fn dispatch(self: Arc<Self>) {
        loop {
            while let Some((path, id, token)) = self.next_request() {
                tokio::spawn(Arc::clone(&self).preload(path, id, token));
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
            }
        }
        debug!("preload dispatcher stopped");
    }

    fn next_request(&self) -> Option<(String, u64, CancellationToken)> {
        let mut state = self.state.lock();
        if state.paused {
            return None;
        }
        while state.running < self.settings.max_tasks {
            let queued = state.queue.pop()?;
            // Cancelled requests leave their queue entry behind.
            let token = match state.requests.get_mut(&queued.path) {
                Some(request) if request.id == queued.id && !request.token.is_cancelled() => {
                    request.running = true;
                    request.token.clone()
                }
                _ => continue,
            };
            state.running += 1;
            return Some((queued.path, queued.id, token));
        }
        None
    }

    async fn preload(self: Arc<Self>, path: String, id: u64, token: CancellationToken) {
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(AssetError::Cancelled),
            result = self.warm(&path) => result,
        };

        let event = {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
            let current = state.requests.get(&path).map(|r| r.id) == Some(id);
            if current {
                state.requests.remove(&path);
            }
            match outcome {
                Ok(pin) if current => {
                    state.preloaded.insert(path.clone(), pin);
                    Some(PreloadEvent::Preloaded(path))
                }
                Err(error) if current && error != AssetError::Cancelled => {
                    Some(PreloadEvent::Failed { path, error })
                }
                _ => None,
            }
        };

        match &event {
            Some(PreloadEvent::Preloaded(path)) => debug!("preloaded {}", path),
            Some(PreloadEvent::Failed { path, error }) => {
                warn!("preload {} failed: {}", path, error)
            }
            None => {}
        }
        if let Some(event) = event {
            // Nobody listening is fine.
            let _ = self.events.send(event);
        }
        self.wake.notify_one();
    }

    /// Make the asset's bundle resident and return the pin holding it there.
    async fn warm(&self, path: &str) -> Result<Option<BundleRef>> {
        if self.loader.strategy().is_simulated() {
            self.loader.strategy().read_source(path).await?;
            return Ok(None);
        }
        let bundle_name = self
            .loader
            .manifest()
            .bundle_name_for_asset(path)
            .map(str::to_string)
            .ok_or_else(|| AssetError::AssetNotFound(path.to_string()))?;
        self.loader.load_bundle(&bundle_name).await.map(Some)
    }
}
