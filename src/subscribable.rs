//! Listener registry shared by the ambient signals and the caches.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registered listeners, in subscription order.
pub struct Listeners<E> {
    inner: Arc<ListenersInner<E>>,
}

struct ListenersInner<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener<E>)>>,
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ListenersInner {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener; it stays registered until the returned guard is dropped.
    pub fn subscribe(&self, listener: Listener<E>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.lock().push((id, listener));
        let weak: Weak<ListenersInner<E>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.entries.lock().retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    pub fn has_listeners(&self) -> bool {
        !self.inner.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current listeners; callers invoke them without holding the lock.
    pub fn snapshot(&self) -> Vec<Listener<E>> {
        self.inner
            .entries
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    /// Call every listener with `event`.
    pub fn emit(&self, event: &E) {
        for listener in self.snapshot() {
            listener(event);
        }
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Unsubscribes when dropped or when [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Chain extra cleanup after the registry removal.
    pub fn then(mut self, after: impl FnOnce() + Send + 'static) -> Self {
        let first = self.remove.take();
        Self::new(move || {
            if let Some(first) = first {
                first();
            }
            after();
        })
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
