//! Configuration System
//!
//! Layered configuration for a [`QueryClient`](crate::client::QueryClient): built-in
//! defaults, then the user's global file, then workspace files, then `QUERYKIT__*`
//! environment variables. Durations are given in milliseconds or as a keyword.

use crate::ambient::Environment;
use crate::client::DefaultOptions;
use crate::error::ClientError;
use crate::gc::GcTime;
use crate::logging::LoggingConfig;
use crate::mutation::MutationOptions;
use crate::query::{QueryOptions, RefetchOn, StaleTime};
use crate::retryer::{NetworkMode, RetryDelay, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod loader;
mod merge;
mod sources;

pub use loader::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryKitConfig {
    #[serde(default)]
    pub client: ClientConfig,

    /// Defaults applied to every query
    #[serde(default)]
    pub queries: QueryDefaultsConfig,

    /// Defaults applied to every mutation
    #[serde(default)]
    pub mutations: MutationDefaultsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `interactive` or `server`
    #[serde(default)]
    pub environment: Environment,
}

/// A duration in milliseconds, or a keyword such as `infinite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeSetting {
    Millis(u64),
    Named(String),
}

impl TimeSetting {
    fn to_stale_time(&self) -> Result<StaleTime, String> {
        match self {
            TimeSetting::Millis(ms) => Ok(StaleTime::After(Duration::from_millis(*ms))),
            TimeSetting::Named(name) => match name.as_str() {
                "infinite" => Ok(StaleTime::Infinite),
                "static" => Ok(StaleTime::Static),
                other => other
                    .parse::<u64>()
                    .map(|ms| StaleTime::After(Duration::from_millis(ms)))
                    .map_err(|_| format!("Invalid stale_time '{}'", other)),
            },
        }
    }

    fn to_gc_time(&self) -> Result<GcTime, String> {
        match self {
            TimeSetting::Millis(ms) => Ok(GcTime::After(Duration::from_millis(*ms))),
            TimeSetting::Named(name) => match name.as_str() {
                "infinite" => Ok(GcTime::Infinite),
                other => other
                    .parse::<u64>()
                    .map(|ms| GcTime::After(Duration::from_millis(ms)))
                    .map_err(|_| format!("Invalid gc_time '{}'", other)),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDefaultsConfig {
    #[serde(default)]
    pub stale_time: Option<TimeSetting>,
    #[serde(default)]
    pub gc_time: Option<TimeSetting>,
    /// Retry count; unset means the environment's default
    #[serde(default)]
    pub retry: Option<u32>,
    /// Fixed delay between retries; unset means exponential backoff
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub network_mode: Option<NetworkMode>,
    #[serde(default)]
    pub refetch_on_window_focus: Option<bool>,
    #[serde(default)]
    pub refetch_on_reconnect: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationDefaultsConfig {
    #[serde(default)]
    pub gc_time: Option<TimeSetting>,
    #[serde(default)]
    pub retry: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub network_mode: Option<NetworkMode>,
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Queries(String),
    Mutations(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Queries(msg) => write!(f, "Queries: {}", msg),
            ValidationError::Mutations(msg) => write!(f, "Mutations: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl QueryDefaultsConfig {
    pub fn to_options(&self) -> Result<QueryOptions, String> {
        let mut options = QueryOptions::default();
        if let Some(stale_time) = &self.stale_time {
            options.stale_time = Some(stale_time.to_stale_time()?);
        }
        if let Some(gc_time) = &self.gc_time {
            options.gc_time = Some(gc_time.to_gc_time()?);
        }
        options.retry = self.retry.map(RetryPolicy::Count);
        options.retry_delay = self
            .retry_delay_ms
            .map(|ms| RetryDelay::Fixed(Duration::from_millis(ms)));
        options.network_mode = self.network_mode;
        options.refetch_on_window_focus = self.refetch_on_window_focus.map(RefetchOn::from);
        options.refetch_on_reconnect = self.refetch_on_reconnect.map(RefetchOn::from);
        Ok(options)
    }
}

impl MutationDefaultsConfig {
    pub fn to_options(&self) -> Result<MutationOptions, String> {
        let mut options = MutationOptions::default();
        if let Some(gc_time) = &self.gc_time {
            options.gc_time = Some(gc_time.to_gc_time()?);
        }
        options.retry = self.retry.map(RetryPolicy::Count);
        options.retry_delay = self
            .retry_delay_ms
            .map(|ms| RetryDelay::Fixed(Duration::from_millis(ms)));
        options.network_mode = self.network_mode;
        Ok(options)
    }
}

impl QueryKitConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.queries.to_options() {
            errors.push(ValidationError::Queries(e));
        }
        if let Err(e) = self.mutations.to_options() {
            errors.push(ValidationError::Mutations(e));
        }
        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Client defaults described by this configuration.
    pub fn default_options(&self) -> Result<DefaultOptions, ClientError> {
        Ok(DefaultOptions {
            queries: self.queries.to_options().map_err(ClientError::ConfigError)?,
            mutations: self
                .mutations
                .to_options()
                .map_err(ClientError::ConfigError)?,
        })
    }
}
