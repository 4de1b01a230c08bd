//! Shared observer lists.
//!
//! Every fan-out point in the bridge (registry changes, client status and
//! tool-list changes, search visibility changes) uses the same contract:
//! subscribing returns a handle that unsubscribes on drop, observers run in
//! unspecified order, and a panicking observer never prevents the next one
//! from running.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A set of observers for events of type `E`.
pub struct Observers<E> {
    inner: Arc<Inner<E>>,
}

struct Inner<E> {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Callback<E>>>,
}

impl<E> Observers<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register an observer. Dropping the returned [`Subscription`]
    /// unregisters it.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .insert(id, Arc::new(callback));

        let inner = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.subscribers.lock().remove(&id);
                }
            })),
        }
    }

    /// Invoke every observer with `event`. Each observer is called at most
    /// once; a panic in one observer is caught and logged so the rest still
    /// run.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> =
            self.inner.subscribers.lock().values().cloned().collect();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!("observer panicked during notification");
            }
        }
    }

    /// Number of registered observers (used by tests).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Observers::subscribe`]; unsubscribes on drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Explicitly unregister the observer.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the observer registered for the lifetime of the [`Observers`].
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
