use tracing::warn;

/// Reference count shared by bundle and asset handles.
///
/// The count never goes below zero and a disposed counter never counts again.
#[derive(Debug, Default)]
pub struct RefCounter {
    count: u32,
    disposed: bool,
}

impl RefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment unless disposed. Returns `false` for a disposed counter.
    pub fn retain(&mut self, label: &str) -> bool {
        if self.disposed {
            warn!("retain on disposed handle {}", label);
            return false;
        }
        self.count += 1;
        true
    }

    /// Decrement, clamped at zero. Returns `true` when this call brought a live
    /// count to zero and the owner should dispose.
    pub fn release(&mut self, label: &str) -> bool {
        if self.disposed {
            return false;
        }
        if self.count == 0 {
            warn!("release on unreferenced handle {}", label);
            return false;
        }
        self.count -= 1;
        self.count == 0
    }

    /// Flag as disposed. Returns `true` only for the first call.
    pub fn mark_disposed(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        self.disposed = true;
        self.count = 0;
        true
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}
