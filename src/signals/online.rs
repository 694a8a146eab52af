//! Connectivity tracking.

use crate::signals::Cleanup;
use crate::subscribable::{Listeners, Subscription};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

pub type OnlineHandler = Arc<dyn Fn(bool) + Send + Sync>;

pub type OnlineSetup = Arc<dyn Fn(OnlineHandler) -> Option<Cleanup> + Send + Sync>;

struct OnlineInner {
    online: Mutex<bool>,
    listeners: Listeners<bool>,
    setup: Mutex<Option<OnlineSetup>>,
    cleanup: Mutex<Option<Cleanup>>,
}

/// Whether the process is online. Starts online.
#[derive(Clone)]
pub struct OnlineManager {
    inner: Arc<OnlineInner>,
}

impl OnlineManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(OnlineInner {
                online: Mutex::new(true),
                listeners: Listeners::new(),
                setup: Mutex::new(None),
                cleanup: Mutex::new(None),
            }),
        }
    }

    fn from_weak(weak: &Weak<OnlineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let subscription = self
            .inner
            .listeners
            .subscribe(Arc::new(move |online: &bool| listener(*online)));
        self.on_subscribe();
        let weak = Arc::downgrade(&self.inner);
        subscription.then(move || {
            if let Some(manager) = Self::from_weak(&weak) {
                manager.on_unsubscribe();
            }
        })
    }

    pub fn has_listeners(&self) -> bool {
        self.inner.listeners.has_listeners()
    }

    /// Replace the connectivity source. Any previous source is cleaned up first.
    pub fn set_event_listener(
        &self,
        setup: impl Fn(OnlineHandler) -> Option<Cleanup> + Send + Sync + 'static,
    ) {
        self.install(Arc::new(setup));
    }

    fn install(&self, setup: OnlineSetup) {
        *self.inner.setup.lock() = Some(Arc::clone(&setup));
        let previous = self.inner.cleanup.lock().take();
        if let Some(cleanup) = previous {
            cleanup();
        }

        let weak = Arc::downgrade(&self.inner);
        let handler: OnlineHandler = Arc::new(move |online: bool| {
            if let Some(manager) = Self::from_weak(&weak) {
                manager.set_online(online);
            }
        });
        let cleanup = setup(handler);
        *self.inner.cleanup.lock() = cleanup;
    }

    fn on_subscribe(&self) {
        let needs_source = self.inner.cleanup.lock().is_none();
        if needs_source {
            let setup = self.inner.setup.lock().clone();
            if let Some(setup) = setup {
                self.install(setup);
            }
        }
    }

    fn on_unsubscribe(&self) {
        if !self.has_listeners() {
            let cleanup = self.inner.cleanup.lock().take();
            if let Some(cleanup) = cleanup {
                cleanup();
            }
        }
    }

    /// Listeners are only told about actual changes.
    pub fn set_online(&self, online: bool) {
        let changed = {
            let mut current = self.inner.online.lock();
            let changed = *current != online;
            *current = online;
            changed
        };
        if changed {
            debug!(online, "Connectivity changed");
            self.inner.listeners.emit(&online);
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.lock()
    }
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new()
    }
}
