//! Atomically replaceable value slots

use std::sync::{Arc, RwLock};

/// A replaceable cell holding a full snapshot value.
///
/// Writers swap in a complete new value; readers get an `Arc` to whichever
/// snapshot was current when they loaded. The lock is held only long enough
/// to copy the pointer, so readers never observe a partially updated value.
/// Empty until the first store; readers must handle that case.
#[derive(Debug)]
pub struct Slot<T> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Current snapshot, or `None` before the first store.
    pub fn load(&self) -> Option<Arc<T>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the value, returning the previous snapshot.
    pub fn swap(&self, value: T) -> Option<Arc<T>> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.replace(Arc::new(value))
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}
