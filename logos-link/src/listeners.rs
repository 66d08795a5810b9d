//! Callback registries for status and latency changes.
//!
//! Each subscription gets its own id; [`Subscription::unsubscribe`] removes
//! exactly that entry. Dropping a [`Subscription`] keeps the callback
//! registered, so fire-and-forget listeners need no bookkeeping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Inner<T> {
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<u64, Callback<T>>>,
}

/// A set of callbacks invoked with a cloned value on every emit.
pub struct Listeners<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, Arc::new(callback));
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .callbacks
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                }
            })),
        }
    }

    /// Call every registered callback. The lock is not held while callbacks
    /// run, so a callback may subscribe or unsubscribe.
    pub fn emit(&self, value: T) {
        let callbacks: Vec<Callback<T>> = self.lock().values().cloned().collect();
        for callback in callbacks {
            callback(value.clone());
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Callback<T>>> {
        self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle returned by `subscribe`.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove this callback. Later emits no longer reach it.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
