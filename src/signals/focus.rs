//! Focus tracking.

use crate::signals::Cleanup;
use crate::subscribable::{Listeners, Subscription};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Called by an event source: `Some(focused)` sets the state, `None` only re-announces it.
pub type FocusHandler = Arc<dyn Fn(Option<bool>) + Send + Sync>;

/// Installs a focus source; receives the handler and returns an optional cleanup.
pub type FocusSetup = Arc<dyn Fn(FocusHandler) -> Option<Cleanup> + Send + Sync>;

struct FocusInner {
    focused: Mutex<Option<bool>>,
    listeners: Listeners<bool>,
    setup: Mutex<Option<FocusSetup>>,
    cleanup: Mutex<Option<Cleanup>>,
}

/// Whether the consuming process is focused. Unknown focus counts as focused.
#[derive(Clone)]
pub struct FocusManager {
    inner: Arc<FocusInner>,
}

impl FocusManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FocusInner {
                focused: Mutex::new(None),
                listeners: Listeners::new(),
                setup: Mutex::new(None),
                cleanup: Mutex::new(None),
            }),
        }
    }

    fn from_weak(weak: &Weak<FocusInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Listen for focus announcements. The first subscriber installs the event source,
    /// the last one to leave tears it down.
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let subscription = self
            .inner
            .listeners
            .subscribe(Arc::new(move |focused: &bool| listener(*focused)));
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

    /// Replace the focus source. Any previous source is cleaned up first.
    pub fn set_event_listener(
        &self,
        setup: impl Fn(FocusHandler) -> Option<Cleanup> + Send + Sync + 'static,
    ) {
        self.install(Arc::new(setup));
    }

    fn install(&self, setup: FocusSetup) {
        *self.inner.setup.lock() = Some(Arc::clone(&setup));
        let previous = self.inner.cleanup.lock().take();
        if let Some(cleanup) = previous {
            cleanup();
        }

        let weak = Arc::downgrade(&self.inner);
        let handler: FocusHandler = Arc::new(move |focused: Option<bool>| {
            if let Some(manager) = Self::from_weak(&weak) {
                match focused {
                    Some(focused) => manager.set_focused(Some(focused)),
                    None => manager.on_focus(),
                }
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

    /// Set the focus state explicitly; `None` returns to "unknown" (treated as focused).
    /// Listeners hear about it only when the value changes.
    pub fn set_focused(&self, focused: Option<bool>) {
        let changed = {
            let mut current = self.inner.focused.lock();
            if *current != focused {
                *current = focused;
                true
            } else {
                false
            }
        };
        if changed {
            debug!(focused = ?focused, "Focus changed");
            self.on_focus();
        }
    }

    /// Announce the current focus state to every listener.
    pub fn on_focus(&self) {
        let focused = self.is_focused();
        self.inner.listeners.emit(&focused);
    }

    pub fn is_focused(&self) -> bool {
        self.inner.focused.lock().unwrap_or(true)
    }
}

impl Default for FocusManager {
    fn default() -> Self {
        Self::new()
    }
}
