//! The public entry point tying caches, defaults and ambient signals together.

use crate::ambient::{Ambient, Environment};
use crate::cache::{
    MutationCache, MutationCacheConfig, MutationFilters, QueryCache, QueryCacheConfig,
    QueryFilters, QueryTypeFilter, RefetchType,
};
use crate::config::QueryKitConfig;
use crate::error::{ClientError, QueryError};
use crate::key::{QueryHash, QueryKey};
use crate::mutation::{Mutation, MutationFuture, MutationOptions, MutationStatus};
use crate::notify::NotifyManager;
use crate::query::{
    CancelOptions, FetchFuture, FetchOptions, FetchStatus, QueryOptions, QueryState, RefetchOn,
    SetDataOptions,
};
use crate::retryer::{NetworkMode, RetryPolicy};
use crate::signals::{FocusManager, OnlineManager};
use crate::subscribable::Subscription;
use futures::future::{self, join_all, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Client-wide defaults for queries and mutations.
#[derive(Debug, Clone, Default)]
pub struct DefaultOptions {
    pub queries: QueryOptions,
    pub mutations: MutationOptions,
}

/// Options for [`QueryClient::refetch_queries`] and [`QueryClient::invalidate_queries`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RefetchOptions {
    /// Defaults to cancelling in-flight fetches.
    pub cancel_refetch: Option<bool>,
    /// Surface the first fetch error instead of swallowing it.
    pub throw_on_error: bool,
}

#[derive(Default)]
struct MountState {
    count: usize,
    focus: Option<Subscription>,
    online: Option<Subscription>,
}

struct ClientInner {
    ambient: Ambient,
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    default_options: RwLock<DefaultOptions>,
    query_defaults: RwLock<Vec<(QueryHash, QueryKey, QueryOptions)>>,
    mutation_defaults: RwLock<Vec<(QueryHash, QueryKey, MutationOptions)>>,
    mount: Mutex<MountState>,
}

/// Shared client handle. Clones refer to the same caches.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

#[derive(Default)]
pub struct QueryClientBuilder {
    environment: Environment,
    notify: Option<NotifyManager>,
    focus: Option<FocusManager>,
    online: Option<OnlineManager>,
    query_cache_config: QueryCacheConfig,
    mutation_cache_config: MutationCacheConfig,
    default_options: DefaultOptions,
}

impl QueryClientBuilder {
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn notify_manager(mut self, notify: NotifyManager) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn focus_manager(mut self, focus: FocusManager) -> Self {
        self.focus = Some(focus);
        self
    }

    pub fn online_manager(mut self, online: OnlineManager) -> Self {
        self.online = Some(online);
        self
    }

    pub fn query_cache_config(mut self, config: QueryCacheConfig) -> Self {
        self.query_cache_config = config;
        self
    }

    pub fn mutation_cache_config(mut self, config: MutationCacheConfig) -> Self {
        self.mutation_cache_config = config;
        self
    }

    pub fn default_options(mut self, options: DefaultOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn build(self) -> QueryClient {
        let ambient = Ambient {
            notify: self.notify.unwrap_or_default(),
            focus: self.focus.unwrap_or_default(),
            online: self.online.unwrap_or_default(),
            environment: self.environment,
        };
        debug!(environment = ?ambient.environment, "Building query client");
        QueryClient {
            inner: Arc::new(ClientInner {
                query_cache: QueryCache::new(ambient.clone(), self.query_cache_config),
                mutation_cache: MutationCache::new(ambient.clone(), self.mutation_cache_config),
                ambient,
                default_options: RwLock::new(self.default_options),
                query_defaults: RwLock::new(Vec::new()),
                mutation_defaults: RwLock::new(Vec::new()),
                mount: Mutex::new(MountState::default()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Regained {
    Focus,
    Connection,
}

impl QueryClient {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::default()
    }

    /// Build a client from loaded configuration.
    pub fn from_config(config: &QueryKitConfig) -> Result<Self, ClientError> {
        config.validate().map_err(|errors| {
            ClientError::Validation(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        Ok(Self::builder()
            .environment(config.client.environment)
            .default_options(config.default_options()?)
            .build())
    }

    fn from_weak(weak: &Weak<ClientInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn ambient(&self) -> &Ambient {
        &self.inner.ambient
    }

    pub fn environment(&self) -> Environment {
        self.inner.ambient.environment
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.inner.query_cache
    }

    pub fn mutation_cache(&self) -> &MutationCache {
        &self.inner.mutation_cache
    }

    /// Start reacting to focus and connectivity. Calls nest; only the first subscribes.
    pub fn mount(&self) {
        {
            let mut mount = self.inner.mount.lock();
            mount.count += 1;
            if mount.count != 1 {
                return;
            }
        }
        let weak = Arc::downgrade(&self.inner);
        let focus = self.inner.ambient.focus.subscribe(move |focused| {
            if focused {
                if let Some(client) = Self::from_weak(&weak) {
                    client.on_regained(Regained::Focus);
                }
            }
        });
        let weak = Arc::downgrade(&self.inner);
        let online = self.inner.ambient.online.subscribe(move |online| {
            if online {
                if let Some(client) = Self::from_weak(&weak) {
                    client.on_regained(Regained::Connection);
                }
            }
        });
        let mut mount = self.inner.mount.lock();
        mount.focus = Some(focus);
        mount.online = Some(online);
        debug!("Query client mounted");
    }

    /// Balance a [`mount`](Self::mount). The last call unsubscribes.
    pub fn unmount(&self) {
        let subscriptions = {
            let mut mount = self.inner.mount.lock();
            mount.count = mount.count.saturating_sub(1);
            if mount.count != 0 {
                return;
            }
            (mount.focus.take(), mount.online.take())
        };
        drop(subscriptions);
        debug!("Query client unmounted");
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mount.lock().count > 0
    }

    fn on_regained(&self, signal: Regained) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(?signal, "No runtime available, ignoring ambient signal");
            return;
        };
        debug!(?signal, "Ambient signal regained");
        let client = self.clone();
        runtime.spawn(async move {
            client.resume_paused_mutations().await;
            match signal {
                Regained::Focus => client.query_cache().on_focus(),
                Regained::Connection => client.query_cache().on_online(),
            }
        });
    }

    /// Number of queries currently fetching.
    pub fn is_fetching(&self, filters: QueryFilters) -> usize {
        self.query_cache()
            .find_all(&filters.with_fetch_status(FetchStatus::Fetching))
            .len()
    }

    /// Number of mutations currently pending.
    pub fn is_mutating(&self, filters: MutationFilters) -> usize {
        self.mutation_cache()
            .find_all(&filters.with_status(MutationStatus::Pending))
            .len()
    }

    fn hash_for(&self, key: impl Into<QueryKey>) -> QueryHash {
        self.default_query_options(QueryOptions::new(key))
            .resolved_hash()
    }

    pub fn get_query_data(&self, key: impl Into<QueryKey>) -> Option<Value> {
        let hash = self.hash_for(key);
        self.query_cache().get(&hash)?.state().data
    }

    pub fn get_query_data_as<T: DeserializeOwned>(
        &self,
        key: impl Into<QueryKey>,
    ) -> Result<Option<T>, QueryError> {
        self.get_query_data(key)
            .map(|data| serde_json::from_value(data).map_err(|e| QueryError::Decode(e.to_string())))
            .transpose()
    }

    pub fn get_query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState> {
        let hash = self.hash_for(key);
        self.query_cache().get(&hash).map(|q| q.state())
    }

    pub fn get_queries_data(&self, filters: QueryFilters) -> Vec<(QueryKey, Option<Value>)> {
        self.query_cache()
            .find_all(&filters)
            .into_iter()
            .map(|q| (q.query_key().clone(), q.state().data))
            .collect()
    }

    /// Write data for `key`. Returning `None` from `updater` leaves the cache untouched.
    pub fn set_query_data(
        &self,
        key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<&Value>) -> Option<Value>,
    ) -> Option<Value> {
        self.set_query_data_with(key, updater, SetDataOptions::default())
    }

    pub fn set_query_data_with(
        &self,
        key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<&Value>) -> Option<Value>,
        options: SetDataOptions,
    ) -> Option<Value> {
        let defaulted = self.default_query_options(QueryOptions::new(key));
        let previous = self
            .query_cache()
            .get(&defaulted.resolved_hash())
            .and_then(|q| q.state().data);
        let data = updater(previous.as_ref())?;
        let query = self.query_cache().build(self, defaulted, None);
        Some(query.set_data(
            data,
            SetDataOptions {
                manual: true,
                ..options
            },
        ))
    }

    pub fn set_queries_data(
        &self,
        filters: QueryFilters,
        updater: impl Fn(Option<&Value>) -> Option<Value>,
    ) -> Vec<(QueryKey, Option<Value>)> {
        let queries = self.query_cache().find_all(&filters);
        self.inner.ambient.notify.batch(|| {
            queries
                .into_iter()
                .map(|q| {
                    let key = q.query_key().clone();
                    let data = self.set_query_data(key.clone(), &updater);
                    (key, data)
                })
                .collect()
        })
    }

    /// Fetch unless fresh data is cached. Retries default to none.
    pub fn fetch_query(&self, options: QueryOptions) -> FetchFuture {
        let mut defaulted = self.default_query_options(options);
        if defaulted.retry.is_none() {
            defaulted.retry = Some(RetryPolicy::Never);
        }
        let query = self.query_cache().build(self, defaulted.clone(), None);
        let state = query.state();
        match state.data {
            Some(data) if !query.is_stale_by_time(defaulted.stale_time_or_default()) => {
                future::ready(Ok(data)).boxed()
            }
            _ => query.fetch(Some(defaulted), FetchOptions::default()),
        }
    }

    pub async fn fetch_query_as<T: DeserializeOwned>(
        &self,
        options: QueryOptions,
    ) -> Result<T, QueryError> {
        let data = self.fetch_query(options).await?;
        serde_json::from_value(data).map_err(|e| QueryError::Decode(e.to_string()))
    }

    /// Like [`fetch_query`](Self::fetch_query) but never fails.
    pub fn prefetch_query(&self, options: QueryOptions) -> BoxFuture<'static, ()> {
        self.fetch_query(options).map(|_| ()).boxed()
    }

    /// Cached data if any, otherwise fetch it.
    pub fn ensure_query_data(&self, options: QueryOptions) -> FetchFuture {
        let defaulted = self.default_query_options(options);
        let query = self.query_cache().build(self, defaulted.clone(), None);
        match query.state().data {
            None => self.fetch_query(defaulted),
            Some(data) => {
                if defaulted.revalidate_if_stale.unwrap_or(false)
                    && query.is_stale_by_time(defaulted.stale_time_or_default())
                {
                    drop(self.prefetch_query(defaulted));
                }
                future::ready(Ok(data)).boxed()
            }
        }
    }

    pub fn remove_queries(&self, filters: QueryFilters) {
        let cache = self.query_cache();
        self.inner.ambient.notify.batch(|| {
            for query in cache.find_all(&filters) {
                cache.remove(&query);
            }
        });
    }

    /// Reset matching queries to their initial state and refetch the active ones.
    pub fn reset_queries(
        &self,
        filters: QueryFilters,
        options: RefetchOptions,
    ) -> BoxFuture<'static, Result<(), QueryError>> {
        self.inner.ambient.notify.batch(|| {
            for query in self.query_cache().find_all(&filters) {
                query.reset();
            }
            let kind = filters.kind.unwrap_or(QueryTypeFilter::Active);
            self.refetch_queries(filters.with_kind(kind), options)
        })
    }

    /// Cancel matching fetches, reverting their state.
    pub fn cancel_queries(&self, filters: QueryFilters) -> BoxFuture<'static, ()> {
        self.cancel_queries_with(
            filters,
            CancelOptions {
                revert: true,
                silent: false,
            },
        )
    }

    pub fn cancel_queries_with(
        &self,
        filters: QueryFilters,
        options: CancelOptions,
    ) -> BoxFuture<'static, ()> {
        let pending: Vec<_> = self.inner.ambient.notify.batch(|| {
            self.query_cache()
                .find_all(&filters)
                .into_iter()
                .map(|q| q.cancel(options))
                .collect()
        });
        async move {
            join_all(pending).await;
        }
        .boxed()
    }

    /// Mark matching queries stale, then refetch them per `refetch_type` (active by default).
    pub fn invalidate_queries(
        &self,
        filters: QueryFilters,
        options: RefetchOptions,
    ) -> BoxFuture<'static, Result<(), QueryError>> {
        self.inner.ambient.notify.batch(|| {
            for query in self.query_cache().find_all(&filters) {
                query.invalidate();
            }
            let kind = match filters.refetch_type {
                Some(RefetchType::None) => return future::ready(Ok(())).boxed(),
                Some(RefetchType::Active) => QueryTypeFilter::Active,
                Some(RefetchType::Inactive) => QueryTypeFilter::Inactive,
                Some(RefetchType::All) => QueryTypeFilter::All,
                None => filters.kind.unwrap_or(QueryTypeFilter::Active),
            };
            self.refetch_queries(filters.with_kind(kind), options)
        })
    }

    /// Refetch matching queries that are neither disabled nor static.
    pub fn refetch_queries(
        &self,
        filters: QueryFilters,
        options: RefetchOptions,
    ) -> BoxFuture<'static, Result<(), QueryError>> {
        let fetch_options = FetchOptions {
            cancel_refetch: options.cancel_refetch.unwrap_or(true),
            meta: None,
        };
        let fetches: Vec<FetchFuture> = self.inner.ambient.notify.batch(|| {
            self.query_cache()
                .find_all(&filters)
                .into_iter()
                .filter(|q| !q.is_disabled() && !q.is_static())
                .filter_map(|q| {
                    let fetch = q.fetch(None, fetch_options.clone());
                    // Paused fetches resolve later; don't wait on them.
                    (q.state().fetch_status != FetchStatus::Paused).then_some(fetch)
                })
                .collect()
        });
        debug!(count = fetches.len(), "Refetching queries");
        let throw_on_error = options.throw_on_error;
        async move {
            let results = join_all(fetches).await;
            if throw_on_error {
                for result in results {
                    result?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Resume paused mutations, but only while online.
    pub fn resume_paused_mutations(&self) -> BoxFuture<'static, ()> {
        if self.inner.ambient.online.is_online() {
            self.mutation_cache().resume_paused_mutations()
        } else {
            future::ready(()).boxed()
        }
    }

    /// Build a mutation and execute it with `variables`.
    pub fn mutate(&self, options: MutationOptions, variables: Value) -> MutationFuture {
        self.build_mutation(options).execute(variables)
    }

    pub fn build_mutation(&self, options: MutationOptions) -> Arc<Mutation> {
        self.mutation_cache().build(self, options, None)
    }

    pub fn get_default_options(&self) -> DefaultOptions {
        self.inner.default_options.read().clone()
    }

    pub fn set_default_options(&self, options: DefaultOptions) {
        *self.inner.default_options.write() = options;
    }

    /// Register defaults for every query whose key starts with `key`.
    pub fn set_query_defaults(&self, key: impl Into<QueryKey>, options: QueryOptions) {
        let key = key.into();
        let hash = key.hash();
        let mut defaults = self.inner.query_defaults.write();
        match defaults.iter_mut().find(|(h, _, _)| *h == hash) {
            Some(entry) => entry.2 = options,
            None => defaults.push((hash, key, options)),
        }
    }

    /// Merged defaults of every registered prefix of `key`, in registration order.
    pub fn get_query_defaults(&self, key: &QueryKey) -> QueryOptions {
        self.inner
            .query_defaults
            .read()
            .iter()
            .filter(|(_, prefix, _)| key.matches(prefix))
            .fold(QueryOptions::default(), |acc, (_, _, options)| acc.merge(options))
    }

    pub fn set_mutation_defaults(&self, key: impl Into<QueryKey>, options: MutationOptions) {
        let key = key.into();
        let hash = key.hash();
        let mut defaults = self.inner.mutation_defaults.write();
        match defaults.iter_mut().find(|(h, _, _)| *h == hash) {
            Some(entry) => entry.2 = options,
            None => defaults.push((hash, key, options)),
        }
    }

    pub fn get_mutation_defaults(&self, key: &QueryKey) -> MutationOptions {
        self.inner
            .mutation_defaults
            .read()
            .iter()
            .filter(|(_, prefix, _)| key.matches(prefix))
            .fold(MutationOptions::default(), |acc, (_, _, options)| {
                acc.merge(options)
            })
    }

    /// Layer client defaults, per-key defaults and `options`, then derive the hash and
    /// the remaining dependent fields. Idempotent.
    pub fn default_query_options(&self, options: QueryOptions) -> QueryOptions {
        if options.defaulted {
            return options;
        }
        let per_key = options
            .query_key
            .as_ref()
            .map(|key| self.get_query_defaults(key))
            .unwrap_or_default();
        let mut defaulted = self
            .inner
            .default_options
            .read()
            .queries
            .merge(&per_key)
            .merge(&options);
        defaulted.defaulted = true;

        if defaulted.query_hash.is_none() {
            defaulted.query_hash = Some(defaulted.resolved_hash());
        }
        if defaulted.refetch_on_reconnect.is_none() {
            defaulted.refetch_on_reconnect = Some(
                if defaulted.network_mode == Some(NetworkMode::Always) {
                    RefetchOn::Never
                } else {
                    RefetchOn::IfStale
                },
            );
        }
        if defaulted.throw_on_error.is_none() {
            defaulted.throw_on_error = Some(defaulted.suspense.unwrap_or(false));
        }
        defaulted
    }

    pub fn default_mutation_options(&self, options: MutationOptions) -> MutationOptions {
        if options.defaulted {
            return options;
        }
        let per_key = options
            .mutation_key
            .as_ref()
            .map(|key| self.get_mutation_defaults(key))
            .unwrap_or_default();
        let mut defaulted = self
            .inner
            .default_options
            .read()
            .mutations
            .merge(&per_key)
            .merge(&options);
        defaulted.defaulted = true;
        defaulted
    }

    /// Drop every query and mutation.
    pub fn clear(&self) {
        info!(
            queries = self.query_cache().len(),
            mutations = self.mutation_cache().len(),
            "Clearing query client"
        );
        self.query_cache().clear();
        self.mutation_cache().clear();
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("environment", &self.inner.ambient.environment)
            .field("query_cache", &self.inner.query_cache)
            .field("mutation_cache", &self.inner.mutation_cache)
            .finish()
    }
}
