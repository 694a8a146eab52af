//! Stores for queries and mutations.

pub mod filters;
pub mod mutation_cache;
pub mod query_cache;

pub use filters::{MutationFilters, QueryFilters, QueryTypeFilter, RefetchType};
pub use mutation_cache::{MutationCache, MutationCacheConfig, MutationCacheEvent};
pub use query_cache::{QueryCache, QueryCacheConfig, QueryCacheEvent};
