//! QueryKit: Async Query Cache and Mutation Orchestration
//!
//! Caches the results of keyed async fetches, deduplicates concurrent requests for the
//! same key, retries failures with backoff, garbage-collects unobserved entries and
//! coordinates writes through scoped, serialized mutations.

pub mod ambient;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod gc;
pub mod hydration;
pub mod key;
pub mod logging;
pub mod mutation;
pub mod notify;
pub mod observer;
pub mod query;
pub mod retryer;
pub mod signals;
pub mod subscribable;

pub use client::{DefaultOptions, QueryClient, RefetchOptions};
pub use error::{CancelledError, ClientError, QueryError};
pub use key::{QueryHash, QueryKey};
pub use mutation::{mutation_fn, MutationOptions};
pub use observer::QueryObserver;
pub use query::{query_fn, QueryOptions};
