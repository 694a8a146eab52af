//! The mutation store, with per-scope serialization.

use crate::ambient::Ambient;
use crate::cache::filters::MutationFilters;
use crate::client::QueryClient;
use crate::error::QueryError;
use crate::mutation::{Mutation, MutationAction, MutationConfig, MutationOptions, MutationState};
use crate::observer::ObserverId;
use crate::subscribable::{Listeners, Subscription};
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Clone)]
pub enum MutationCacheEvent {
    Added { mutation: Arc<Mutation> },
    Removed { mutation: Arc<Mutation> },
    Updated { mutation: Arc<Mutation>, action: MutationAction },
    ObserverAdded { mutation: Arc<Mutation>, observer: ObserverId },
    ObserverRemoved { mutation: Arc<Mutation>, observer: ObserverId },
}

impl MutationCacheEvent {
    pub fn mutation(&self) -> &Arc<Mutation> {
        match self {
            MutationCacheEvent::Added { mutation }
            | MutationCacheEvent::Removed { mutation }
            | MutationCacheEvent::Updated { mutation, .. }
            | MutationCacheEvent::ObserverAdded { mutation, .. }
            | MutationCacheEvent::ObserverRemoved { mutation, .. } => mutation,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MutationCacheEvent::Added { .. } => "added",
            MutationCacheEvent::Removed { .. } => "removed",
            MutationCacheEvent::Updated { .. } => "updated",
            MutationCacheEvent::ObserverAdded { .. } => "observerAdded",
            MutationCacheEvent::ObserverRemoved { .. } => "observerRemoved",
        }
    }
}

impl fmt::Debug for MutationCacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCacheEvent")
            .field("kind", &self.kind())
            .field("mutation_id", &self.mutation().mutation_id())
            .finish()
    }
}

pub type CacheOnMutate = Arc<dyn Fn(Value, Arc<Mutation>) -> BoxFuture<'static, ()> + Send + Sync>;
/// `(data, variables, context, mutation)`
pub type CacheOnSuccess = Arc<
    dyn Fn(Value, Value, Option<Value>, Arc<Mutation>) -> BoxFuture<'static, ()> + Send + Sync,
>;
/// `(error, variables, context, mutation)`
pub type CacheOnError = Arc<
    dyn Fn(QueryError, Value, Option<Value>, Arc<Mutation>) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;
/// `(data, error, variables, context, mutation)`
pub type CacheOnSettled = Arc<
    dyn Fn(
            Option<Value>,
            Option<QueryError>,
            Value,
            Option<Value>,
            Arc<Mutation>,
        ) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// Cache-wide hooks. Each runs before the mutation's own hook of the same name.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
    pub on_mutate: Option<CacheOnMutate>,
    pub on_success: Option<CacheOnSuccess>,
    pub on_error: Option<CacheOnError>,
    pub on_settled: Option<CacheOnSettled>,
}

pub(crate) struct MutationCacheInner {
    mutations: Mutex<BTreeMap<u64, Arc<Mutation>>>,
    /// Scope id to the mutations that claimed it, in submission order. The head runs.
    scopes: Mutex<HashMap<String, VecDeque<Arc<Mutation>>>>,
    listeners: Listeners<MutationCacheEvent>,
    config: MutationCacheConfig,
    ambient: Ambient,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct MutationCache {
    inner: Arc<MutationCacheInner>,
}

impl MutationCache {
    pub fn new(ambient: Ambient, config: MutationCacheConfig) -> Self {
        Self {
            inner: Arc::new(MutationCacheInner {
                mutations: Mutex::new(BTreeMap::new()),
                scopes: Mutex::new(HashMap::new()),
                listeners: Listeners::new(),
                config,
                ambient,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<MutationCacheInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<MutationCacheInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &MutationCacheConfig {
        &self.inner.config
    }

    /// Create a mutation with the next id and add it.
    pub fn build(
        &self,
        client: &QueryClient,
        options: MutationOptions,
        state: Option<MutationState>,
    ) -> Arc<Mutation> {
        let mutation = Mutation::new(MutationConfig {
            mutation_id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            options: client.default_mutation_options(options),
            state,
            cache: self.downgrade(),
            ambient: self.inner.ambient.clone(),
        });
        self.add(Arc::clone(&mutation));
        mutation
    }

    pub fn add(&self, mutation: Arc<Mutation>) {
        self.inner
            .mutations
            .lock()
            .insert(mutation.mutation_id(), Arc::clone(&mutation));
        self.notify(MutationCacheEvent::Added { mutation });
    }

    pub fn remove(&self, mutation: &Arc<Mutation>) {
        let removed = self
            .inner
            .mutations
            .lock()
            .remove(&mutation.mutation_id())
            .is_some();
        if !removed {
            return;
        }
        self.run_next(mutation);
        mutation.clear_gc();
        debug!(mutation_id = mutation.mutation_id(), "Mutation removed from cache");
        self.notify(MutationCacheEvent::Removed {
            mutation: Arc::clone(mutation),
        });
    }

    /// Join the back of the scope's queue, unless already in it. Returns true when
    /// `mutation` heads the queue and may start now.
    pub(crate) fn claim_scope(&self, mutation: &Arc<Mutation>) -> bool {
        let Some(scope) = mutation.scope_id() else {
            return true;
        };
        let mut scopes = self.inner.scopes.lock();
        let queue = scopes.entry(scope).or_default();
        if !queue.iter().any(|m| Arc::ptr_eq(m, mutation)) {
            queue.push_back(Arc::clone(mutation));
        }
        queue.front().map_or(true, |head| Arc::ptr_eq(head, mutation))
    }

    /// True when `mutation` is unscoped or heads its scope's queue.
    pub fn can_run(&self, mutation: &Arc<Mutation>) -> bool {
        let Some(scope) = mutation.scope_id() else {
            return true;
        };
        self.inner
            .scopes
            .lock()
            .get(&scope)
            .and_then(|queue| queue.front())
            .map_or(true, |head| Arc::ptr_eq(head, mutation))
    }

    /// Drop `mutation` from its scope's queue and wake the new head.
    pub fn run_next(&self, mutation: &Arc<Mutation>) {
        let Some(scope) = mutation.scope_id() else {
            return;
        };
        let next = {
            let mut scopes = self.inner.scopes.lock();
            let Some(queue) = scopes.get_mut(&scope) else {
                return;
            };
            queue.retain(|m| !Arc::ptr_eq(m, mutation));
            let next = queue.front().cloned();
            if queue.is_empty() {
                scopes.remove(&scope);
            }
            next
        };
        if let Some(next) = next {
            debug!(
                mutation_id = next.mutation_id(),
                scope = %scope,
                "Handing scope to next mutation"
            );
            next.wake_for_scope();
        }
    }

    pub fn clear(&self) {
        let all = self.get_all();
        let notify = self.inner.ambient.notify.clone();
        notify.batch(|| {
            for mutation in &all {
                self.remove(mutation);
            }
        });
    }

    /// Every mutation, in creation order.
    pub fn get_all(&self) -> Vec<Arc<Mutation>> {
        self.inner.mutations.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.mutations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First match; the key is matched exactly unless `exact` is set to false.
    pub fn find(&self, filters: &MutationFilters) -> Option<Arc<Mutation>> {
        let filters = MutationFilters {
            exact: Some(filters.exact.unwrap_or(true)),
            ..filters.clone()
        };
        self.get_all().into_iter().find(|m| filters.matches(m))
    }

    pub fn find_all(&self, filters: &MutationFilters) -> Vec<Arc<Mutation>> {
        self.get_all()
            .into_iter()
            .filter(|m| filters.matches(m))
            .collect()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationCacheEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.subscribe(Arc::new(listener))
    }

    pub fn notify(&self, event: MutationCacheEvent) {
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

    /// Resume every paused mutation and wait for all of them.
    pub fn resume_paused_mutations(&self) -> BoxFuture<'static, ()> {
        let paused: Vec<Arc<Mutation>> = self
            .get_all()
            .into_iter()
            .filter(|m| m.state().is_paused)
            .collect();
        if paused.is_empty() {
            return futures::future::ready(()).boxed();
        }
        debug!(count = paused.len(), "Resuming paused mutations");
        let notify = self.inner.ambient.notify.clone();
        let executions: Vec<_> = notify.batch(|| paused.iter().map(|m| m.resume()).collect());
        async move {
            join_all(executions).await;
        }
        .boxed()
    }
}

impl fmt::Debug for MutationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCache")
            .field("mutations", &self.len())
            .field("scopes", &self.inner.scopes.lock().len())
            .finish()
    }
}
