//! Ambient signals: focus and connectivity.
//!
//! Both managers hold a boolean with subscribe/notify semantics. Detection is pluggable
//! through `set_event_listener`: the host supplies a setup function that receives a
//! handler to call when its source changes, and returns an optional cleanup.

pub mod focus;
pub mod online;

pub use focus::FocusManager;
pub use online::OnlineManager;

/// Cleanup returned by an event-listener setup.
pub type Cleanup = Box<dyn FnOnce() + Send>;
