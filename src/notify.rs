//! Batched notification scheduling.
//!
//! State changes schedule their subscriber callbacks here. Inside [`NotifyManager::batch`]
//! callbacks are queued; when the outermost batch returns, the queue is handed to the
//! scheduler as one flush, preserving the order the callbacks were scheduled in.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

pub type Callback = Box<dyn FnOnce() + Send>;

/// Wraps the invocation of each individual callback.
pub type NotifyFn = Arc<dyn Fn(Callback) + Send + Sync>;

/// Wraps a whole flush; invoked exactly once per flush.
pub type BatchNotifyFn = Arc<dyn Fn(Callback) + Send + Sync>;

/// Decides when scheduled work runs. The default runs it immediately.
pub type ScheduleFn = Arc<dyn Fn(Callback) + Send + Sync>;

#[derive(Default)]
struct Pending {
    depth: usize,
    queue: Vec<Callback>,
}

struct NotifyInner {
    pending: Mutex<Pending>,
    notify_fn: RwLock<NotifyFn>,
    batch_notify_fn: RwLock<BatchNotifyFn>,
    schedule_fn: RwLock<ScheduleFn>,
}

/// Notification scheduler. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct NotifyManager {
    inner: Arc<NotifyInner>,
}

impl NotifyManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NotifyInner {
                pending: Mutex::new(Pending::default()),
                notify_fn: RwLock::new(Arc::new(|cb: Callback| cb())),
                batch_notify_fn: RwLock::new(Arc::new(|cb: Callback| cb())),
                schedule_fn: RwLock::new(Arc::new(|cb: Callback| cb())),
            }),
        }
    }

    /// Run `f`, deferring every callback scheduled inside it until the outermost batch ends.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.pending.lock().depth += 1;
        let _guard = BatchGuard { manager: self };
        f()
    }

    /// Queue `callback` when inside a batch, otherwise hand it to the scheduler now.
    pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.inner.pending.lock();
            if pending.depth > 0 {
                pending.queue.push(Box::new(callback));
                return;
            }
        }
        let notify_fn = self.inner.notify_fn.read().clone();
        let schedule_fn = self.inner.schedule_fn.read().clone();
        schedule_fn(Box::new(move || notify_fn(Box::new(callback))));
    }

    /// Wrap `f` so that every call goes through [`NotifyManager::schedule`].
    pub fn batch_calls<A, F>(&self, f: F) -> impl Fn(A) + Send + Sync
    where
        A: Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        let manager = self.clone();
        let f = Arc::new(f);
        move |arg: A| {
            let f = Arc::clone(&f);
            manager.schedule(move || f(arg));
        }
    }

    /// Number of batches currently open.
    pub fn depth(&self) -> usize {
        self.inner.pending.lock().depth
    }

    pub fn set_notify_function(&self, f: impl Fn(Callback) + Send + Sync + 'static) {
        *self.inner.notify_fn.write() = Arc::new(f);
    }

    pub fn set_batch_notify_function(&self, f: impl Fn(Callback) + Send + Sync + 'static) {
        *self.inner.batch_notify_fn.write() = Arc::new(f);
    }

    pub fn set_scheduler(&self, f: impl Fn(Callback) + Send + Sync + 'static) {
        *self.inner.schedule_fn.write() = Arc::new(f);
    }

    fn end_batch(&self) {
        let queue = {
            let mut pending = self.inner.pending.lock();
            pending.depth = pending.depth.saturating_sub(1);
            if pending.depth > 0 || pending.queue.is_empty() {
                return;
            }
            std::mem::take(&mut pending.queue)
        };
        let notify_fn = self.inner.notify_fn.read().clone();
        let batch_notify_fn = self.inner.batch_notify_fn.read().clone();
        let schedule_fn = self.inner.schedule_fn.read().clone();
        schedule_fn(Box::new(move || {
            batch_notify_fn(Box::new(move || {
                for callback in queue {
                    notify_fn(callback);
                }
            }))
        }));
    }
}

impl Default for NotifyManager {
    fn default() -> Self {
        Self::new()
    }
}

struct BatchGuard<'a> {
    manager: &'a NotifyManager,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.manager.end_batch();
    }
}
