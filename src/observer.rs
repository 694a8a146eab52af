//! Observation handles for queries.
//!
//! A [`QueryObserver`] registers interest in one query. The query stores only the
//! observer's id, options and listener; dropping the handle deregisters it, and once a
//! query has no observers its GC countdown starts.

use crate::client::QueryClient;
use crate::clock::now_millis;
use crate::query::{
    FetchFuture, FetchOptions, ObserverSlot, Query, QueryOptions, QueryState, RefetchOn, StaleTime,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receives every new state of the observed query.
pub type StateListener = Arc<dyn Fn(&QueryState) + Send + Sync>;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    pub fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// The parts of an observer's options a query consults.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverOptions {
    pub enabled: bool,
    pub stale_time: StaleTime,
    pub refetch_on_window_focus: RefetchOn,
    pub refetch_on_reconnect: RefetchOn,
}

impl ObserverOptions {
    /// Expects options already passed through the client's defaults.
    pub fn from_query_options(options: &QueryOptions) -> Self {
        Self {
            enabled: options.is_enabled(),
            stale_time: options.stale_time_or_default(),
            refetch_on_window_focus: options.refetch_on_window_focus.unwrap_or_default(),
            refetch_on_reconnect: options.refetch_on_reconnect.unwrap_or_default(),
        }
    }

    pub(crate) fn should_refetch(&self, policy: RefetchOn, state: &QueryState, now: i64) -> bool {
        if !self.enabled || self.stale_time == StaleTime::Static {
            return false;
        }
        match policy {
            RefetchOn::Never => false,
            RefetchOn::Always => true,
            RefetchOn::IfStale => state.is_stale_by_time(self.stale_time, now),
        }
    }
}

/// Keeps a query observed for as long as it lives.
pub struct QueryObserver {
    id: ObserverId,
    query: Arc<Query>,
    options: ObserverOptions,
}

impl QueryObserver {
    pub fn new(client: &QueryClient, options: QueryOptions) -> Self {
        Self::register(client, options, None)
    }

    /// Observe and receive every state change through `listener`.
    pub fn subscribe(
        client: &QueryClient,
        options: QueryOptions,
        listener: impl Fn(&QueryState) + Send + Sync + 'static,
    ) -> Self {
        Self::register(client, options, Some(Arc::new(listener)))
    }

    fn register(
        client: &QueryClient,
        options: QueryOptions,
        listener: Option<StateListener>,
    ) -> Self {
        let defaulted = client.default_query_options(options);
        let query = client.query_cache().build(client, defaulted.clone(), None);
        let observer_options = ObserverOptions::from_query_options(&defaulted);
        let id = ObserverId::next();
        query.add_observer(ObserverSlot {
            id,
            options: observer_options.clone(),
            listener,
        });
        Self {
            id,
            query,
            options: observer_options,
        }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    pub fn state(&self) -> QueryState {
        self.query.state()
    }

    pub fn options(&self) -> &ObserverOptions {
        &self.options
    }

    pub fn is_stale(&self) -> bool {
        self.query
            .state()
            .is_stale_by_time(self.options.stale_time, now_millis())
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.options.enabled = enabled;
        self.query.update_observer(self.id, self.options.clone());
    }

    /// Fetch if enabled and the data is stale; mirrors what mounting a view would do.
    pub fn fetch_if_stale(&self) -> Option<FetchFuture> {
        (self.options.enabled && self.options.stale_time != StaleTime::Static && self.is_stale())
            .then(|| self.query.fetch(None, FetchOptions::default()))
    }

    /// Fetch now, replacing an in-flight fetch.
    pub fn refetch(&self) -> FetchFuture {
        self.query.fetch(
            None,
            FetchOptions {
                cancel_refetch: true,
                meta: None,
            },
        )
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.query.remove_observer(self.id);
    }
}

impl fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.id)
            .field("query_hash", self.query.query_hash())
            .field("options", &self.options)
            .finish()
    }
}
