// Bundle handles: the resident native bundle plus the dependency handles it pins.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::refcount::RefCounter;
use crate::loader::backend::{BundleBackend, NativeBundle};
use crate::manifest::BundleInfo;

struct BundleState {
    native: Option<NativeBundle>,
    /// Held in load order; dropping them releases the dependencies.
    dependencies: Vec<BundleRef>,
    counter: RefCounter,
}

pub struct BundleHandle {
    info: BundleInfo,
    backend: Arc<dyn BundleBackend>,
    load_time: Duration,
    loaded_at: DateTime<Utc>,
    state: Mutex<BundleState>,
}

impl BundleHandle {
    /// Wrap a freshly loaded bundle. The handle starts unreferenced; callers
    /// obtain strong references through [`BundleHandle::acquire`].
    pub fn new(
        info: BundleInfo,
        native: NativeBundle,
        dependencies: Vec<BundleRef>,
        backend: Arc<dyn BundleBackend>,
        load_time: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            backend,
            load_time,
            loaded_at: Utc::now(),
            state: Mutex::new(BundleState {
                native: Some(native),
                dependencies,
                counter: RefCounter::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.info.bundle_name
    }

    pub fn info(&self) -> &BundleInfo {
        &self.info
    }

    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    pub fn ref_count(&self) -> u32 {
        self.state.lock().counter.count()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().counter.is_disposed()
    }

    pub fn is_valid(&self) -> bool {
        let state = self.state.lock();
        !state.counter.is_disposed() && state.native.is_some()
    }

    /// The loaded bundle, or `None` once disposed.
    pub fn native(&self) -> Option<NativeBundle> {
        self.state.lock().native.clone()
    }

    pub fn dependency_names(&self) -> Vec<String> {
        self.state
            .lock()
            .dependencies
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Increment the count. A disposed handle logs and stays disposed.
    pub fn retain(&self) -> bool {
        let retained = self.state.lock().counter.retain(self.name());
        if retained {
            debug!("bundle {} retained", self.name());
        }
        retained
    }

    /// Decrement the count, disposing at zero.
    pub fn release(&self) {
        let reached_zero = self.state.lock().counter.release(self.name());
        if reached_zero {
            self.dispose();
        }
    }

    /// Unload the native bundle, then release the dependencies. Idempotent.
    pub fn dispose(&self) {
        let (native, dependencies) = {
            let mut state = self.state.lock();
            if !state.counter.mark_disposed() {
                return;
            }
            (state.native.take(), std::mem::take(&mut state.dependencies))
        };

        if let Some(native) = native {
            self.backend.unload(native);
        }
        debug!("bundle {} unloaded", self.name());
        drop(dependencies);
    }

    /// Take a strong reference, or `None` if the handle is already disposed.
    pub fn acquire(self: &Arc<Self>) -> Option<BundleRef> {
        if self.retain() {
            Some(BundleRef {
                handle: Arc::clone(self),
            })
        } else {
            None
        }
    }

    pub fn downgrade(self: &Arc<Self>) -> WeakBundle {
        WeakBundle {
            name: self.name().to_string(),
            handle: Arc::downgrade(self),
        }
    }

    pub fn snapshot(&self) -> BundleSnapshot {
        let state = self.state.lock();
        BundleSnapshot {
            bundle_name: self.info.bundle_name.clone(),
            ref_count: state.counter.count(),
            disposed: state.counter.is_disposed(),
            dependencies: state
                .dependencies
                .iter()
                .map(|d| d.name().to_string())
                .collect(),
            size: self.info.size,
            load_time: self.load_time,
            loaded_at: self.loaded_at,
        }
    }
}

impl fmt::Debug for BundleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BundleHandle")
            .field("name", &self.info.bundle_name)
            .field("ref_count", &state.counter.count())
            .field("disposed", &state.counter.is_disposed())
            .finish()
    }
}

/// Owning reference to a bundle handle. Cloning retains, dropping releases.
pub struct BundleRef {
    handle: Arc<BundleHandle>,
}

impl BundleRef {
    pub fn handle(&self) -> &Arc<BundleHandle> {
        &self.handle
    }

    pub fn downgrade(&self) -> WeakBundle {
        self.handle.downgrade()
    }
}

impl Deref for BundleRef {
    type Target = BundleHandle;

    fn deref(&self) -> &BundleHandle {
        &self.handle
    }
}

impl Clone for BundleRef {
    fn clone(&self) -> Self {
        self.handle.retain();
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl Drop for BundleRef {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl fmt::Debug for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.handle, f)
    }
}

/// Non-owning observer of a bundle handle, for inspection tooling.
#[derive(Clone)]
pub struct WeakBundle {
    name: String,
    handle: Weak<BundleHandle>,
}

impl WeakBundle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, or `None` once the handle itself has been dropped.
    pub fn snapshot(&self) -> Option<BundleSnapshot> {
        self.handle.upgrade().map(|h| h.snapshot())
    }

    pub fn is_alive(&self) -> bool {
        self.handle
            .upgrade()
            .map(|h| !h.is_disposed())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BundleSnapshot {
    pub bundle_name: String,
    pub ref_count: u32,
    pub disposed: bool,
    pub dependencies: Vec<String>,
    pub size: u64,
    pub load_time: Duration,
    pub loaded_at: DateTime<Utc>,
}
