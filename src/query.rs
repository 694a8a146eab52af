//! One cache entry: its state machine, its in-flight fetch and its observers.
//!
//! A [`Query`] is owned by the [`QueryCache`](crate::cache::QueryCache) and handed out as
//! `Arc<Query>`. Every state change goes through [`QueryState::reduce`]; the new state is
//! pushed to observers and to cache listeners inside a notification batch.

pub mod options;
pub mod state;

pub use options::{
    query_fn, FetchOptions, QueryFn, QueryFunctionContext, QueryOptions, RefetchOn, StaleTime,
};
pub use state::{FetchStatus, QueryAction, QueryState, QueryStatus};

use crate::ambient::Ambient;
use crate::cache::query_cache::{QueryCache, QueryCacheEvent, QueryCacheInner};
use crate::clock::now_millis;
use crate::error::{CancelledError, QueryError};
use crate::gc::{GcTime, GcTimer};
use crate::key::{QueryHash, QueryKey};
use crate::observer::{ObserverId, ObserverOptions, StateListener};
use crate::retryer::{RetryPolicy, Retryer, RetryerConfig, RetryerStatus, RunFn};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Future returned by [`Query::fetch`].
pub type FetchFuture = BoxFuture<'static, Result<Value, QueryError>>;

/// Options for [`Query::cancel`].
pub type CancelOptions = CancelledError;

/// Options for [`Query::set_data`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetDataOptions {
    pub updated_at: Option<i64>,
    pub manual: bool,
}

pub(crate) struct ObserverSlot {
    pub id: ObserverId,
    pub options: ObserverOptions,
    pub listener: Option<StateListener>,
}

struct QueryCore {
    state: QueryState,
    initial_state: QueryState,
    revert_state: Option<QueryState>,
    options: QueryOptions,
    default_options: QueryOptions,
    gc_time: GcTime,
    observers: Vec<ObserverSlot>,
    retryer: Option<Retryer<Value>>,
    fetch_generation: u64,
    abort_signal_consumed: Arc<AtomicBool>,
    /// A flush delivering the current state to observer listeners is already queued.
    listeners_scheduled: bool,
}

pub(crate) struct QueryConfig {
    pub options: QueryOptions,
    pub default_options: QueryOptions,
    pub state: Option<QueryState>,
    pub cache: Weak<QueryCacheInner>,
    pub ambient: Ambient,
    pub seq: u64,
}

pub struct Query {
    me: Weak<Query>,
    query_key: QueryKey,
    query_hash: QueryHash,
    seq: u64,
    ambient: Ambient,
    cache: Weak<QueryCacheInner>,
    gc: GcTimer,
    core: Mutex<QueryCore>,
}

enum FetchPlan {
    Attach(Retryer<Value>),
    Start {
        retryer: Retryer<Value>,
        superseded: Option<Retryer<Value>>,
        dispatch: Option<QueryAction>,
    },
}

impl Query {
    pub(crate) fn new(config: QueryConfig) -> Arc<Query> {
        let QueryConfig {
            options,
            default_options,
            state,
            cache,
            ambient,
            seq,
        } = config;
        let query_key = options.resolved_key();
        let query_hash = options.resolved_hash();
        let gc_time = options
            .gc_time
            .unwrap_or_else(|| GcTime::from_option(ambient.environment.default_gc_time()));
        let initial_state = QueryState::initial(&options, now_millis());
        let state = state.unwrap_or_else(|| initial_state.clone());

        let query = Arc::new_cyclic(|me| Query {
            me: me.clone(),
            query_key,
            query_hash,
            seq,
            ambient,
            cache,
            gc: GcTimer::new(),
            core: Mutex::new(QueryCore {
                state,
                initial_state,
                revert_state: None,
                options,
                default_options,
                gc_time,
                observers: Vec::new(),
                retryer: None,
                fetch_generation: 0,
                abort_signal_consumed: Arc::new(AtomicBool::new(false)),
                listeners_scheduled: false,
            }),
        });
        query.schedule_gc();
        query
    }

    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    pub fn query_hash(&self) -> &QueryHash {
        &self.query_hash
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> QueryState {
        self.core.lock().state.clone()
    }

    pub fn options(&self) -> QueryOptions {
        self.core.lock().options.clone()
    }

    pub fn meta(&self) -> Option<Value> {
        self.core.lock().options.meta.clone()
    }

    pub fn gc_time(&self) -> GcTime {
        self.core.lock().gc_time
    }

    pub fn observers_count(&self) -> usize {
        self.core.lock().observers.len()
    }

    /// Replace the options, layered over the per-key defaults. GC time only grows.
    pub fn set_options(&self, options: QueryOptions) {
        let mut core = self.core.lock();
        Self::apply_options(&mut core, options, &self.ambient);
    }

    fn apply_options(core: &mut QueryCore, options: QueryOptions, ambient: &Ambient) {
        core.options = core.default_options.merge(&options);
        let requested = core
            .options
            .gc_time
            .unwrap_or_else(|| GcTime::from_option(ambient.environment.default_gc_time()));
        core.gc_time = core.gc_time.max(requested);
    }

    /// Write data directly. Returns the stored value.
    pub fn set_data(&self, data: Value, options: SetDataOptions) -> Value {
        self.dispatch(QueryAction::Success {
            data: data.clone(),
            updated_at: options.updated_at.unwrap_or_else(now_millis),
            manual: options.manual,
        });
        data
    }

    pub fn set_state(&self, state: QueryState) {
        self.dispatch(QueryAction::SetState(Box::new(state)));
    }

    /// Cancel the in-flight fetch. The returned future completes once it has settled.
    pub fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()> {
        let retryer = self.core.lock().retryer.clone();
        match retryer {
            Some(retryer) => {
                let promise = retryer.promise();
                retryer.cancel(options);
                async move {
                    let _ = promise.await;
                }
                .boxed()
            }
            None => future::ready(()).boxed(),
        }
    }

    /// Stop GC and silently cancel any fetch. Called when leaving the cache.
    pub fn destroy(&self) {
        self.gc.clear();
        let _ = self.cancel(CancelOptions {
            revert: false,
            silent: true,
        });
    }

    /// Back to the state the query was created with.
    pub fn reset(&self) {
        self.destroy();
        let (initial, unobserved) = {
            let core = self.core.lock();
            (core.initial_state.clone(), core.observers.is_empty())
        };
        self.set_state(initial);
        if unobserved {
            self.schedule_gc();
        }
    }

    pub fn invalidate(&self) {
        if !self.core.lock().state.is_invalidated {
            self.dispatch(QueryAction::Invalidate);
        }
    }

    /// Any observer with `enabled` set.
    pub fn is_active(&self) -> bool {
        self.core.lock().observers.iter().any(|o| o.options.enabled)
    }

    /// Disabled when observed only by disabled observers, or when unobserved and
    /// either without a query function or never fetched.
    pub fn is_disabled(&self) -> bool {
        let core = self.core.lock();
        if !core.observers.is_empty() {
            return !core.observers.iter().any(|o| o.options.enabled);
        }
        core.options.query_fn.is_none()
            || core.state.data_update_count + core.state.error_update_count == 0
    }

    /// Some observer declares the data static.
    pub fn is_static(&self) -> bool {
        self.core
            .lock()
            .observers
            .iter()
            .any(|o| o.options.enabled && o.options.stale_time == StaleTime::Static)
    }

    pub fn is_stale(&self) -> bool {
        let core = self.core.lock();
        if core.observers.is_empty() {
            return core.state.data.is_none() || core.state.is_invalidated;
        }
        let now = now_millis();
        core.observers
            .iter()
            .any(|o| o.options.enabled && core.state.is_stale_by_time(o.options.stale_time, now))
    }

    pub fn is_stale_by_time(&self, stale_time: StaleTime) -> bool {
        self.core
            .lock()
            .state
            .is_stale_by_time(stale_time, now_millis())
    }

    pub fn is_fetch_in_flight(&self) -> bool {
        self.core.lock().state.fetch_status != FetchStatus::Idle
    }

    pub(crate) fn add_observer(&self, slot: ObserverSlot) {
        let id = slot.id;
        {
            let mut core = self.core.lock();
            if core.observers.iter().any(|o| o.id == id) {
                return;
            }
            core.observers.push(slot);
        }
        self.gc.clear();
        debug!(query_hash = %self.query_hash, observer = id.get(), "Observer added");
        self.notify_cache(|query| QueryCacheEvent::ObserverAdded {
            query,
            observer: id,
        });
    }

    pub(crate) fn update_observer(&self, id: ObserverId, options: ObserverOptions) {
        let mut core = self.core.lock();
        if let Some(slot) = core.observers.iter_mut().find(|o| o.id == id) {
            slot.options = options;
        }
    }

    pub(crate) fn remove_observer(&self, id: ObserverId) {
        let abandoned = {
            let mut core = self.core.lock();
            let before = core.observers.len();
            core.observers.retain(|o| o.id != id);
            if core.observers.len() == before {
                return;
            }
            if core.observers.is_empty() {
                let consumed = core
                    .abort_signal_consumed
                    .load(std::sync::atomic::Ordering::SeqCst);
                Some((core.retryer.clone(), consumed))
            } else {
                None
            }
        };

        if let Some((retryer, consumed)) = abandoned {
            if let Some(retryer) = retryer {
                if consumed {
                    retryer.cancel(CancelOptions {
                        revert: true,
                        silent: false,
                    });
                } else {
                    retryer.cancel_retry();
                }
            }
            self.schedule_gc();
        }
        debug!(query_hash = %self.query_hash, observer = id.get(), "Observer removed");
        self.notify_cache(|query| QueryCacheEvent::ObserverRemoved {
            query,
            observer: id,
        });
    }

    /// Refetch if an observer asks for it on focus, then wake a paused fetch.
    pub fn on_focus(&self) {
        self.refetch_on_signal(|o| o.refetch_on_window_focus);
    }

    /// Refetch if an observer asks for it on reconnect, then wake a paused fetch.
    pub fn on_online(&self) {
        self.refetch_on_signal(|o| o.refetch_on_reconnect);
    }

    fn refetch_on_signal(&self, policy: impl Fn(&ObserverOptions) -> RefetchOn) {
        let (should_fetch, retryer) = {
            let core = self.core.lock();
            let now = now_millis();
            let should_fetch = core
                .observers
                .iter()
                .any(|o| o.options.should_refetch(policy(&o.options), &core.state, now));
            (should_fetch, core.retryer.clone())
        };
        if should_fetch {
            debug!(query_hash = %self.query_hash, "Refetching on ambient signal");
            drop(self.fetch(
                None,
                FetchOptions {
                    cancel_refetch: false,
                    meta: None,
                },
            ));
        }
        if let Some(retryer) = retryer {
            retryer.resume();
        }
    }

    /// Start a fetch, or join the one already in flight.
    ///
    /// The fetch runs on the Tokio runtime whether or not the returned future is polled.
    pub fn fetch(&self, options: Option<QueryOptions>, fetch_options: FetchOptions) -> FetchFuture {
        let Some(this) = self.me.upgrade() else {
            return future::ready(Err(QueryError::Cancelled(CancelledError::default()))).boxed();
        };

        let plan = {
            let mut core = self.core.lock();
            self.plan_fetch(&mut core, options, &fetch_options)
        };

        match plan {
            FetchPlan::Attach(retryer) => {
                debug!(query_hash = %self.query_hash, "Joining in-flight fetch");
                Self::await_fetch(this, retryer)
            }
            FetchPlan::Start {
                retryer,
                superseded,
                dispatch,
            } => {
                if let Some(previous) = superseded {
                    debug!(query_hash = %self.query_hash, "Cancelling fetch in favour of a refetch");
                    previous.cancel(CancelOptions {
                        revert: false,
                        silent: true,
                    });
                }
                if let Some(action) = dispatch {
                    self.dispatch(action);
                }
                debug!(query_hash = %self.query_hash, "Fetch started");
                retryer.start();
                Self::await_fetch(this, retryer)
            }
        }
    }

    fn plan_fetch(
        &self,
        core: &mut QueryCore,
        options: Option<QueryOptions>,
        fetch_options: &FetchOptions,
    ) -> FetchPlan {
        let mut superseded = None;
        if core.state.fetch_status != FetchStatus::Idle {
            let live = core
                .retryer
                .clone()
                .filter(|r| r.status() != RetryerStatus::Rejected);
            if let Some(retryer) = live {
                if core.state.data.is_some() && fetch_options.cancel_refetch {
                    superseded = Some(retryer);
                } else {
                    retryer.continue_retry();
                    return FetchPlan::Attach(retryer);
                }
            }
        }

        if let Some(options) = options {
            Self::apply_options(core, options, &self.ambient);
        }

        core.fetch_generation += 1;
        let generation = core.fetch_generation;
        let abort = CancellationToken::new();
        let consumed = Arc::new(AtomicBool::new(false));
        core.abort_signal_consumed = Arc::clone(&consumed);

        let context = QueryFunctionContext::new(
            self.query_key.clone(),
            self.query_hash.clone(),
            core.options.meta.clone(),
            abort.clone(),
            consumed,
        );
        let query_fn = core.options.query_fn.clone();
        let query_hash = self.query_hash.clone();
        let run: RunFn<Value> = Arc::new(move || {
            let query_hash = query_hash.clone();
            match &query_fn {
                // Null stands in for "no value", which a successful query cannot hold.
                Some(f) => f(context.clone())
                    .map(move |outcome| match outcome {
                        Ok(Value::Null) => Err(QueryError::InvalidData {
                            query_hash,
                            reason: "query function resolved to null".to_string(),
                        }),
                        other => other,
                    })
                    .boxed(),
                None => future::ready(Err(QueryError::MissingQueryFn { query_hash })).boxed(),
            }
        });

        core.revert_state = Some(core.state.clone());

        let network_mode = core.options.network_mode.unwrap_or_default();
        let mut config = RetryerConfig::new(run, &self.ambient);
        config.retry = core
            .options
            .retry
            .clone()
            .unwrap_or(RetryPolicy::Count(self.ambient.environment.default_query_retries()));
        config.retry_delay = core.options.retry_delay.clone().unwrap_or_default();
        config.network_mode = network_mode;
        config.abort = abort;

        let weak = self.me.clone();
        config.on_fail = Some(Arc::new(move |failure_count, error: &QueryError| {
            if let Some(query) = weak.upgrade() {
                query.dispatch(QueryAction::Failed {
                    failure_count,
                    error: error.clone(),
                });
            }
        }));
        let weak = self.me.clone();
        config.on_pause = Some(Arc::new(move || {
            if let Some(query) = weak.upgrade() {
                query.dispatch(QueryAction::Pause);
            }
        }));
        let weak = self.me.clone();
        config.on_continue = Some(Arc::new(move || {
            if let Some(query) = weak.upgrade() {
                query.dispatch(QueryAction::Continue);
            }
        }));
        let weak = self.me.clone();
        config.on_cancel = Some(Arc::new(move |cancel: CancelledError| {
            if let Some(query) = weak.upgrade() {
                query.on_fetch_cancelled(cancel, generation);
            }
        }));
        let weak = self.me.clone();
        config.on_settled = Some(Box::new(move |outcome: &Result<Value, QueryError>| {
            if let Some(query) = weak.upgrade() {
                query.on_fetch_settled(outcome);
            }
        }));

        let retryer = Retryer::new(config);
        core.retryer = Some(retryer.clone());

        let dispatch = (core.state.fetch_status == FetchStatus::Idle
            || core.state.fetch_meta != fetch_options.meta)
            .then(|| QueryAction::Fetch {
                meta: fetch_options.meta.clone(),
                paused: !network_mode.can_fetch(&self.ambient.online),
            });

        FetchPlan::Start {
            retryer,
            superseded,
            dispatch,
        }
    }

    fn await_fetch(this: Arc<Query>, retryer: Retryer<Value>) -> FetchFuture {
        async move {
            let mut current = retryer;
            loop {
                let outcome = current.promise().await;
                match outcome {
                    Err(QueryError::Cancelled(cancel)) if cancel.silent => {
                        let next = this.core.lock().retryer.clone();
                        match next {
                            Some(next) if !next.ptr_eq(&current) => current = next,
                            _ => return Err(QueryError::Cancelled(cancel)),
                        }
                    }
                    Err(QueryError::Cancelled(cancel)) if cancel.revert => {
                        let data = this.core.lock().state.data.clone();
                        return data.ok_or(QueryError::Cancelled(cancel));
                    }
                    other => return other,
                }
            }
        }
        .boxed()
    }

    fn on_fetch_cancelled(&self, cancel: CancelledError, generation: u64) {
        let restored = {
            let core = self.core.lock();
            if core.fetch_generation != generation {
                return;
            }
            if cancel.revert {
                core.revert_state.clone().map(|mut state| {
                    state.fetch_status = FetchStatus::Idle;
                    state
                })
            } else if cancel.silent {
                let mut state = core.state.clone();
                state.fetch_status = FetchStatus::Idle;
                Some(state)
            } else {
                None
            }
        };
        if let Some(state) = restored {
            debug!(query_hash = %self.query_hash, revert = cancel.revert, "Fetch cancelled");
            self.set_state(state);
        }
    }

    fn on_fetch_settled(&self, outcome: &Result<Value, QueryError>) {
        let cache = self.cache();
        match outcome {
            Ok(data) => {
                self.set_data(data.clone(), SetDataOptions::default());
                debug!(query_hash = %self.query_hash, "Fetch succeeded");
                if let (Some(cache), Some(this)) = (&cache, self.me.upgrade()) {
                    let hooks = cache.config();
                    if let Some(on_success) = &hooks.on_success {
                        on_success(data, &this);
                    }
                    if let Some(on_settled) = &hooks.on_settled {
                        on_settled(Some(data), None, &this);
                    }
                }
            }
            Err(QueryError::Cancelled(cancel)) if cancel.silent || cancel.revert => {}
            Err(error) => {
                warn!(query_hash = %self.query_hash, error = %error, "Fetch failed");
                self.dispatch(QueryAction::Error {
                    error: error.clone(),
                    at: now_millis(),
                });
                if let (Some(cache), Some(this)) = (&cache, self.me.upgrade()) {
                    let hooks = cache.config();
                    if let Some(on_error) = &hooks.on_error {
                        on_error(error, &this);
                    }
                    if let Some(on_settled) = &hooks.on_settled {
                        let data = this.state().data;
                        on_settled(data.as_ref(), Some(error), &this);
                    }
                }
            }
        }
        self.schedule_gc();
    }

    pub(crate) fn dispatch(&self, action: QueryAction) {
        let schedule_listeners = {
            let mut core = self.core.lock();
            let next = core.state.reduce(&action);
            if let QueryAction::Success { manual, .. } = &action {
                core.revert_state = manual.then(|| next.clone());
            }
            core.state = next;
            let observed = core.observers.iter().any(|o| o.listener.is_some());
            let schedule = observed && !core.listeners_scheduled;
            if schedule {
                core.listeners_scheduled = true;
            }
            schedule
        };

        let notify = &self.ambient.notify;
        notify.batch(|| {
            if schedule_listeners {
                let weak = self.me.clone();
                notify.schedule(move || {
                    if let Some(query) = weak.upgrade() {
                        query.notify_listeners();
                    }
                });
            }
            self.notify_cache(|query| QueryCacheEvent::Updated { query, action });
        });
    }

    /// Hand observer listeners the state as it is now. Updates made since the
    /// flush was queued collapse into this one call.
    fn notify_listeners(&self) {
        let (state, listeners) = {
            let mut core = self.core.lock();
            core.listeners_scheduled = false;
            let listeners: Vec<StateListener> = core
                .observers
                .iter()
                .filter_map(|o| o.listener.clone())
                .collect();
            (core.state.clone(), listeners)
        };
        for listener in listeners {
            listener(&state);
        }
    }

    fn cache(&self) -> Option<QueryCache> {
        self.cache.upgrade().map(QueryCache::from_inner)
    }

    fn notify_cache(&self, event: impl FnOnce(Arc<Query>) -> QueryCacheEvent) {
        if let (Some(cache), Some(this)) = (self.cache(), self.me.upgrade()) {
            cache.notify(event(this));
        }
    }

    pub(crate) fn schedule_gc(&self) {
        let gc_time = self.core.lock().gc_time;
        let weak = self.me.clone();
        self.gc.schedule(gc_time, move || {
            if let Some(query) = weak.upgrade() {
                query.optional_remove();
            }
        });
    }

    pub(crate) fn is_gc_scheduled(&self) -> bool {
        self.gc.is_scheduled()
    }

    fn optional_remove(&self) {
        let removable = {
            let core = self.core.lock();
            core.observers.is_empty() && core.state.fetch_status == FetchStatus::Idle
        };
        if !removable {
            return;
        }
        if let (Some(cache), Some(this)) = (self.cache(), self.me.upgrade()) {
            debug!(query_hash = %self.query_hash, "Collecting unused query");
            cache.remove(&this);
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Query")
            .field("query_hash", &self.query_hash)
            .field("status", &core.state.status)
            .field("fetch_status", &core.state.fetch_status)
            .field("observers", &core.observers.len())
            .finish()
    }
}
