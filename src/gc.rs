//! Garbage-collection countdowns for cache entities.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long an unobserved entity is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTime {
    After(Duration),
    /// Never collected.
    Infinite,
}

impl GcTime {
    pub fn from_option(duration: Option<Duration>) -> Self {
        duration.map_or(GcTime::Infinite, GcTime::After)
    }

    /// The longer of the two.
    pub fn max(self, other: GcTime) -> GcTime {
        match (self, other) {
            (GcTime::Infinite, _) | (_, GcTime::Infinite) => GcTime::Infinite,
            (GcTime::After(a), GcTime::After(b)) => GcTime::After(a.max(b)),
        }
    }
}

/// One pending countdown; rescheduling aborts the previous one.
#[derive(Default)]
pub struct GcTimer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GcTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_expire` after `gc_time`. Without a Tokio runtime nothing is scheduled.
    pub fn schedule(&self, gc_time: GcTime, on_expire: impl FnOnce() + Send + 'static) {
        self.clear();
        let GcTime::After(delay) = gc_time else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, skipping gc countdown");
            return;
        };
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            on_expire();
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn clear(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        self.clear();
    }
}
