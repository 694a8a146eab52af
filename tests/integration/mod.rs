//! Integration tests for the query cache engine

mod ambient_signals;
mod config_integration;
mod garbage_collection;
mod mutation_scopes;
mod notifications;
mod query_fetching;

pub use test_utils::*;
