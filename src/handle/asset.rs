use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::refcount::RefCounter;

struct AssetState<T> {
    asset: Option<Arc<T>>,
    counter: RefCounter,
}

/// A loaded asset with its own reference count.
///
/// The handle records which bundle it came from but does not pin it; the
/// loader keeps that bundle retained while the asset is tracked.
pub struct AssetHandle<T> {
    path: String,
    bundle_name: Option<String>,
    load_time: Duration,
    state: Mutex<AssetState<T>>,
}

impl<T: Send + Sync + 'static> AssetHandle<T> {
    /// New handle holding one reference for its creator.
    pub fn new(
        path: impl Into<String>,
        asset: T,
        bundle_name: Option<String>,
        load_time: Duration,
    ) -> Arc<Self> {
        let path = path.into();
        let mut counter = RefCounter::new();
        counter.retain(&path);
        Arc::new(Self {
            path,
            bundle_name,
            load_time,
            state: Mutex::new(AssetState {
                asset: Some(Arc::new(asset)),
                counter,
            }),
        })
    }

    pub fn asset(&self) -> Option<Arc<T>> {
        self.state.lock().asset.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `None` for assets read straight from the source tree.
    pub fn bundle_name(&self) -> Option<&str> {
        self.bundle_name.as_deref()
    }

    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    pub fn ref_count(&self) -> u32 {
        self.state.lock().counter.count()
    }

    pub fn is_valid(&self) -> bool {
        let state = self.state.lock();
        !state.counter.is_disposed() && state.asset.is_some()
    }

    pub fn retain(&self) -> bool {
        self.state.lock().counter.retain(&self.path)
    }

    /// Returns `true` when this release disposed the handle.
    pub fn release(&self) -> bool {
        let reached_zero = self.state.lock().counter.release(&self.path);
        if reached_zero {
            self.dispose();
        }
        reached_zero
    }

    pub fn dispose(&self) {
        let asset = {
            let mut state = self.state.lock();
            if !state.counter.mark_disposed() {
                return;
            }
            state.asset.take()
        };
        drop(asset);
        debug!("asset {} disposed", self.path);
    }
}

impl<T> fmt::Debug for AssetHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AssetHandle")
            .field("path", &self.path)
            .field("bundle", &self.bundle_name)
            .field("ref_count", &state.counter.count())
            .finish()
    }
}

/// Type-erased view of an [`AssetHandle`] for the loader's tracking table.
pub trait TrackedAsset: Send + Sync {
    fn path(&self) -> &str;
    fn type_name(&self) -> &'static str;
    fn ref_count(&self) -> u32;
    fn is_valid(&self) -> bool;
    fn retain(&self) -> bool;
    fn release(&self) -> bool;
    fn dispose(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + Sync + 'static> TrackedAsset for AssetHandle<T> {
    fn path(&self) -> &str {
        &self.path
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn ref_count(&self) -> u32 {
        AssetHandle::ref_count(self)
    }

    fn is_valid(&self) -> bool {
        AssetHandle::is_valid(self)
    }

    fn retain(&self) -> bool {
        AssetHandle::retain(self)
    }

    fn release(&self) -> bool {
        AssetHandle::release(self)
    }

    fn dispose(&self) {
        AssetHandle::dispose(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
