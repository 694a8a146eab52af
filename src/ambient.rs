//! Long-lived services threaded through a client and everything it builds.

use crate::notify::NotifyManager;
use crate::signals::{FocusManager, OnlineManager};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Execution context of the client. Selects retry and GC defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// A long-running interactive process.
    #[default]
    Interactive,
    /// A short-lived request handler; nothing is retried or collected by default.
    Server,
}

impl Environment {
    /// Default query retry count.
    pub fn default_query_retries(self) -> u32 {
        match self {
            Environment::Interactive => 3,
            Environment::Server => 0,
        }
    }

    /// Default GC time; `None` means entries are never collected.
    pub fn default_gc_time(self) -> Option<Duration> {
        match self {
            Environment::Interactive => Some(Duration::from_secs(5 * 60)),
            Environment::Server => None,
        }
    }
}

/// The services shared by a client, its caches and their entities.
#[derive(Clone, Default)]
pub struct Ambient {
    pub notify: NotifyManager,
    pub focus: FocusManager,
    pub online: OnlineManager,
    pub environment: Environment,
}

impl Ambient {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            ..Self::default()
        }
    }
}
