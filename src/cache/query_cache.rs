//! The query store: hash-indexed queries plus change notifications.

use crate::ambient::Ambient;
use crate::cache::filters::QueryFilters;
use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::QueryHash;
use crate::observer::ObserverId;
use crate::query::{Query, QueryAction, QueryConfig, QueryOptions, QueryState};
use crate::subscribable::{Listeners, Subscription};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Something changed in the cache.
#[derive(Clone)]
pub enum QueryCacheEvent {
    Added { query: Arc<Query> },
    Removed { query: Arc<Query> },
    Updated { query: Arc<Query>, action: QueryAction },
    ObserverAdded { query: Arc<Query>, observer: ObserverId },
    ObserverRemoved { query: Arc<Query>, observer: ObserverId },
}

impl QueryCacheEvent {
    pub fn query(&self) -> &Arc<Query> {
        match self {
            QueryCacheEvent::Added { query }
            | QueryCacheEvent::Removed { query }
            | QueryCacheEvent::Updated { query, .. }
            | QueryCacheEvent::ObserverAdded { query, .. }
            | QueryCacheEvent::ObserverRemoved { query, .. } => query,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueryCacheEvent::Added { .. } => "added",
            QueryCacheEvent::Removed { .. } => "removed",
            QueryCacheEvent::Updated { .. } => "updated",
            QueryCacheEvent::ObserverAdded { .. } => "observerAdded",
            QueryCacheEvent::ObserverRemoved { .. } => "observerRemoved",
        }
    }
}

impl fmt::Debug for QueryCacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCacheEvent")
            .field("kind", &self.kind())
            .field("query_hash", self.query().query_hash())
            .finish()
    }
}

pub type QuerySuccessHook = Arc<dyn Fn(&Value, &Arc<Query>) + Send + Sync>;
pub type QueryErrorHook = Arc<dyn Fn(&QueryError, &Arc<Query>) + Send + Sync>;
pub type QuerySettledHook =
    Arc<dyn Fn(Option<&Value>, Option<&QueryError>, &Arc<Query>) + Send + Sync>;

/// Cache-wide hooks, run after every fetch outcome.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
    pub on_success: Option<QuerySuccessHook>,
    pub on_error: Option<QueryErrorHook>,
    pub on_settled: Option<QuerySettledHook>,
}

pub(crate) struct QueryCacheInner {
    queries: Mutex<HashMap<QueryHash, Arc<Query>>>,
    listeners: Listeners<QueryCacheEvent>,
    config: QueryCacheConfig,
    ambient: Ambient,
    next_seq: AtomicU64,
}

/// Shared handle; clones refer to the same store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<QueryCacheInner>,
}

impl QueryCache {
    pub fn new(ambient: Ambient, config: QueryCacheConfig) -> Self {
        Self {
            inner: Arc::new(QueryCacheInner {
                queries: Mutex::new(HashMap::new()),
                listeners: Listeners::new(),
                config,
                ambient,
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<QueryCacheInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<QueryCacheInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    /// The query for `options`, created if absent. Options pass through the client's defaults.
    pub fn build(
        &self,
        client: &QueryClient,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Arc<Query> {
        let options = client.default_query_options(options);
        let query_hash = options.resolved_hash();

        let created = {
            let mut queries = self.inner.queries.lock();
            if let Some(existing) = queries.get(&query_hash) {
                return Arc::clone(existing);
            }
            let default_options = client.get_query_defaults(&options.resolved_key());
            let query = Query::new(QueryConfig {
                options,
                default_options,
                state,
                cache: self.downgrade(),
                ambient: self.inner.ambient.clone(),
                seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            });
            queries.insert(query_hash.clone(), Arc::clone(&query));
            query
        };

        debug!(query_hash = %query_hash, "Query added to cache");
        self.notify(QueryCacheEvent::Added {
            query: Arc::clone(&created),
        });
        created
    }

    /// Insert an already built query. Ignored if its hash is taken.
    pub fn add(&self, query: Arc<Query>) {
        let inserted = {
            let mut queries = self.inner.queries.lock();
            if queries.contains_key(query.query_hash()) {
                false
            } else {
                queries.insert(query.query_hash().clone(), Arc::clone(&query));
                true
            }
        };
        if inserted {
            self.notify(QueryCacheEvent::Added { query });
        }
    }

    /// Destroy `query` and drop it from the store.
    pub fn remove(&self, query: &Arc<Query>) {
        let removed = {
            let mut queries = self.inner.queries.lock();
            match queries.get(query.query_hash()) {
                Some(existing) if Arc::ptr_eq(existing, query) => {
                    queries.remove(query.query_hash());
                    true
                }
                _ => false,
            }
        };
        if removed {
            query.destroy();
            debug!(query_hash = %query.query_hash(), "Query removed from cache");
            self.notify(QueryCacheEvent::Removed {
                query: Arc::clone(query),
            });
        }
    }

    pub fn clear(&self) {
        let notify = self.inner.ambient.notify.clone();
        notify.batch(|| {
            for query in self.get_all() {
                self.remove(&query);
            }
        });
    }

    pub fn get(&self, query_hash: &QueryHash) -> Option<Arc<Query>> {
        self.inner.queries.lock().get(query_hash).cloned()
    }

    /// Every query, oldest first.
    pub fn get_all(&self) -> Vec<Arc<Query>> {
        let mut all: Vec<Arc<Query>> = self.inner.queries.lock().values().cloned().collect();
        all.sort_by_key(|q| q.seq());
        all
    }

    pub fn len(&self) -> usize {
        self.inner.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First match; the key is matched exactly unless `exact` is set to false.
    pub fn find(&self, filters: &QueryFilters) -> Option<Arc<Query>> {
        let filters = QueryFilters {
            exact: Some(filters.exact.unwrap_or(true)),
            ..filters.clone()
        };
        self.get_all().into_iter().find(|q| filters.matches(q))
    }

    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<Query>> {
        self.get_all()
            .into_iter()
            .filter(|q| filters.matches(q))
            .collect()
    }

    /// Listen to every cache event. Delivered through the notification scheduler.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryCacheEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.subscribe(Arc::new(listener))
    }

    pub fn notify(&self, event: QueryCacheEvent) {
        let listeners = self.inner.listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        let notify = &self.inner.ambient.notify;
        notify.batch(|| {
            for listener in listeners {
                let event = event.clone();
                notify.schedule(move || listener(&event));
            }
        });
    }

    pub fn on_focus(&self) {
        let notify = self.inner.ambient.notify.clone();
        notify.batch(|| {
            for query in self.get_all() {
                query.on_focus();
            }
        });
    }

    pub fn on_online(&self) {
        let notify = self.inner.ambient.notify.clone();
        notify.batch(|| {
            for query in self.get_all() {
                query.on_online();
            }
        });
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.len())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}
