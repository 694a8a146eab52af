//! Predicates for selecting queries and mutations.

use crate::key::{hash_key_with, QueryKey};
use crate::mutation::{Mutation, MutationStatus};
use crate::query::{FetchStatus, Query};
use std::fmt;
use std::sync::Arc;

/// Which queries a filter selects by observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryTypeFilter {
    #[default]
    All,
    /// Observed by at least one enabled observer.
    Active,
    Inactive,
}

/// Which invalidated queries are refetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchType {
    None,
    Active,
    Inactive,
    All,
}

pub type QueryPredicate = Arc<dyn Fn(&Query) -> bool + Send + Sync>;
pub type MutationPredicate = Arc<dyn Fn(&Mutation) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct QueryFilters {
    pub query_key: Option<QueryKey>,
    /// Match the key's hash exactly instead of by prefix.
    pub exact: Option<bool>,
    pub kind: Option<QueryTypeFilter>,
    pub stale: Option<bool>,
    pub fetch_status: Option<FetchStatus>,
    pub predicate: Option<QueryPredicate>,
    pub refetch_type: Option<RefetchType>,
}

impl QueryFilters {
    /// Matches every query.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn exact(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            exact: Some(true),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: QueryTypeFilter) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    pub fn with_fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    pub fn with_predicate(mut self, predicate: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_refetch_type(mut self, refetch_type: RefetchType) -> Self {
        self.refetch_type = Some(refetch_type);
        self
    }

    pub fn matches(&self, query: &Query) -> bool {
        if let Some(key) = &self.query_key {
            if self.exact.unwrap_or(false) {
                let hash_fn = query.options().query_key_hash_fn;
                if *query.query_hash() != hash_key_with(key, hash_fn.as_ref()) {
                    return false;
                }
            } else if !query.query_key().matches(key) {
                return false;
            }
        }

        match self.kind.unwrap_or_default() {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active if !query.is_active() => return false,
            QueryTypeFilter::Inactive if query.is_active() => return false,
            _ => {}
        }

        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }

        if let Some(fetch_status) = self.fetch_status {
            if query.state().fetch_status != fetch_status {
                return false;
            }
        }

        self.predicate.as_ref().map_or(true, |p| p(query))
    }
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("kind", &self.kind)
            .field("stale", &self.stale)
            .field("fetch_status", &self.fetch_status)
            .field("refetch_type", &self.refetch_type)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct MutationFilters {
    pub mutation_key: Option<QueryKey>,
    pub exact: Option<bool>,
    pub status: Option<MutationStatus>,
    pub predicate: Option<MutationPredicate>,
}

impl MutationFilters {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            mutation_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_exact(mut self, exact: bool) -> Self {
        self.exact = Some(exact);
        self
    }

    pub fn with_status(mut self, status: MutationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Mutation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, mutation: &Mutation) -> bool {
        if let Some(key) = &self.mutation_key {
            let Some(own) = mutation.options().mutation_key else {
                return false;
            };
            if self.exact.unwrap_or(false) {
                if own.hash() != key.hash() {
                    return false;
                }
            } else if !own.matches(key) {
                return false;
            }
        }

        if let Some(status) = self.status {
            if mutation.state().status != status {
                return false;
            }
        }

        self.predicate.as_ref().map_or(true, |p| p(mutation))
    }
}

impl fmt::Debug for MutationFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationFilters")
            .field("mutation_key", &self.mutation_key)
            .field("exact", &self.exact)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
