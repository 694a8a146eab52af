//! One write operation and its lifecycle.
//!
//! [`Mutation::execute`] runs on the Tokio runtime: it waits for its scope, runs
//! `on_mutate`, retries the mutation function, then runs the success or error hooks
//! (cache-level first, then the mutation's own) before the final state is dispatched.

pub mod options;
pub mod state;

pub use options::{
    mutation_fn, MutationFn, MutationFunctionContext, MutationOptions, MutationScope, OnMutate,
    OnMutationError, OnMutationSettled, OnMutationSuccess,
};
pub use state::{MutationAction, MutationState, MutationStatus};

use crate::ambient::Ambient;
use crate::cache::mutation_cache::{MutationCache, MutationCacheEvent, MutationCacheInner};
use crate::clock::now_millis;
use crate::error::QueryError;
use crate::gc::{GcTime, GcTimer};
use crate::observer::ObserverId;
use crate::retryer::{RetryPolicy, Retryer, RetryerConfig, RunFn};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Outcome of an execution, shared by everyone awaiting it.
pub type MutationFuture = Shared<BoxFuture<'static, Result<Value, QueryError>>>;

struct MutationCore {
    state: MutationState,
    options: MutationOptions,
    gc_time: GcTime,
    observers: Vec<ObserverId>,
    retryer: Option<Retryer<Value>>,
    execution: Option<MutationFuture>,
}

pub(crate) struct MutationConfig {
    pub mutation_id: u64,
    pub options: MutationOptions,
    pub state: Option<MutationState>,
    pub cache: Weak<MutationCacheInner>,
    pub ambient: Ambient,
}

pub struct Mutation {
    me: Weak<Mutation>,
    mutation_id: u64,
    ambient: Ambient,
    cache: Weak<MutationCacheInner>,
    gc: GcTimer,
    scope_turn: Notify,
    core: Mutex<MutationCore>,
}

impl Mutation {
    pub(crate) fn new(config: MutationConfig) -> Arc<Mutation> {
        let MutationConfig {
            mutation_id,
            options,
            state,
            cache,
            ambient,
        } = config;
        let gc_time = options
            .gc_time
            .unwrap_or_else(|| GcTime::from_option(ambient.environment.default_gc_time()));
        let mutation = Arc::new_cyclic(|me| Mutation {
            me: me.clone(),
            mutation_id,
            ambient,
            cache,
            gc: GcTimer::new(),
            scope_turn: Notify::new(),
            core: Mutex::new(MutationCore {
                state: state.unwrap_or_default(),
                options,
                gc_time,
                observers: Vec::new(),
                retryer: None,
                execution: None,
            }),
        });
        mutation.schedule_gc();
        mutation
    }

    pub fn mutation_id(&self) -> u64 {
        self.mutation_id
    }

    pub fn state(&self) -> MutationState {
        self.core.lock().state.clone()
    }

    pub fn options(&self) -> MutationOptions {
        self.core.lock().options.clone()
    }

    pub fn scope_id(&self) -> Option<String> {
        self.core.lock().options.scope_id().map(str::to_string)
    }

    pub fn set_options(&self, options: MutationOptions) {
        let mut core = self.core.lock();
        core.options = options;
        let requested = core
            .options
            .gc_time
            .unwrap_or_else(|| GcTime::from_option(self.ambient.environment.default_gc_time()));
        core.gc_time = core.gc_time.max(requested);
    }

    pub fn add_observer(&self, id: ObserverId) {
        {
            let mut core = self.core.lock();
            if core.observers.contains(&id) {
                return;
            }
            core.observers.push(id);
        }
        self.gc.clear();
        self.notify_cache(|mutation| MutationCacheEvent::ObserverAdded {
            mutation,
            observer: id,
        });
    }

    pub fn remove_observer(&self, id: ObserverId) {
        {
            let mut core = self.core.lock();
            let before = core.observers.len();
            core.observers.retain(|o| *o != id);
            if core.observers.len() == before {
                return;
            }
        }
        self.schedule_gc();
        self.notify_cache(|mutation| MutationCacheEvent::ObserverRemoved {
            mutation,
            observer: id,
        });
    }

    /// Start executing with `variables`. The scope is claimed before the work is
    /// spawned, so executions of one scope start in the order they were submitted.
    pub fn execute(&self, variables: Value) -> MutationFuture {
        let Some(this) = self.me.upgrade() else {
            return future::ready(Err(QueryError::msg("mutation dropped")))
                .boxed()
                .shared();
        };
        let first_in_scope = self.cache().map_or(true, |cache| cache.claim_scope(&this));
        if !first_in_scope && self.state().status != MutationStatus::Pending {
            debug!(
                mutation_id = self.mutation_id,
                scope = ?self.scope_id(),
                "Mutation queued behind its scope"
            );
            self.dispatch(MutationAction::Queued {
                variables: variables.clone(),
            });
        }
        let handle = tokio::spawn(this.run(variables));
        let execution = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(QueryError::msg(format!("mutation task failed: {}", e))))
        }
        .boxed()
        .shared();
        self.core.lock().execution = Some(execution.clone());
        execution
    }

    /// Continue a paused or queued execution; a restored mutation with no execution
    /// yet is executed with its stored variables.
    pub fn resume(&self) -> MutationFuture {
        let (retryer, execution, variables) = {
            let core = self.core.lock();
            (
                core.retryer.clone(),
                core.execution.clone(),
                core.state.variables.clone(),
            )
        };
        match execution {
            Some(execution) => {
                self.scope_turn.notify_one();
                if let Some(retryer) = retryer {
                    retryer.resume();
                }
                execution
            }
            None => self.execute(variables.unwrap_or(Value::Null)),
        }
    }

    async fn run(self: Arc<Self>, variables: Value) -> Result<Value, QueryError> {
        let cache = self.cache();
        let restored = self.state().status == MutationStatus::Pending;

        if let Some(cache) = &cache {
            while !cache.can_run(&self) {
                self.scope_turn.notified().await;
            }
        }

        let retryer = self.build_retryer(&variables);
        self.core.lock().retryer = Some(retryer.clone());

        let outcome = self.run_attempts(&retryer, &cache, &variables, restored).await;
        let outcome = match outcome {
            Ok(data) => Ok(data),
            Err(error) => {
                warn!(mutation_id = self.mutation_id, error = %error, "Mutation failed");
                self.run_error_hooks(&cache, &error, &variables).await;
                self.dispatch(MutationAction::Error {
                    error: error.clone(),
                });
                Err(error)
            }
        };

        if let Some(cache) = &cache {
            cache.run_next(&self);
        }
        outcome
    }

    async fn run_attempts(
        self: &Arc<Self>,
        retryer: &Retryer<Value>,
        cache: &Option<MutationCache>,
        variables: &Value,
        restored: bool,
    ) -> Result<Value, QueryError> {
        let options = self.options();
        if restored {
            self.dispatch(MutationAction::Continue);
        } else {
            self.dispatch(MutationAction::Pending {
                variables: variables.clone(),
                context: None,
                is_paused: !retryer.can_start(),
                submitted_at: now_millis(),
            });
            if let Some(hook) = cache.as_ref().and_then(|c| c.config().on_mutate.clone()) {
                hook(variables.clone(), Arc::clone(self)).await;
            }
            if let Some(on_mutate) = &options.on_mutate {
                let context = on_mutate(variables.clone()).await?;
                if context != self.state().context {
                    self.dispatch(MutationAction::Pending {
                        variables: variables.clone(),
                        context,
                        is_paused: !retryer.can_start(),
                        submitted_at: self.state().submitted_at,
                    });
                }
            }
        }

        let data = retryer.start().await?;
        let context = self.state().context;

        if let Some(hook) = cache.as_ref().and_then(|c| c.config().on_success.clone()) {
            hook(
                data.clone(),
                variables.clone(),
                context.clone(),
                Arc::clone(self),
            )
            .await;
        }
        if let Some(on_success) = &options.on_success {
            on_success(data.clone(), variables.clone(), context.clone()).await;
        }
        if let Some(hook) = cache.as_ref().and_then(|c| c.config().on_settled.clone()) {
            hook(
                Some(data.clone()),
                None,
                variables.clone(),
                context.clone(),
                Arc::clone(self),
            )
            .await;
        }
        if let Some(on_settled) = &options.on_settled {
            on_settled(Some(data.clone()), None, variables.clone(), context).await;
        }

        debug!(mutation_id = self.mutation_id, "Mutation succeeded");
        self.dispatch(MutationAction::Success { data: data.clone() });
        Ok(data)
    }

    async fn run_error_hooks(
        self: &Arc<Self>,
        cache: &Option<MutationCache>,
        error: &QueryError,
        variables: &Value,
    ) {
        let options = self.options();
        let context = self.state().context;
        if let Some(hook) = cache.as_ref().and_then(|c| c.config().on_error.clone()) {
            hook(
                error.clone(),
                variables.clone(),
                context.clone(),
                Arc::clone(self),
            )
            .await;
        }
        if let Some(on_error) = &options.on_error {
            on_error(error.clone(), variables.clone(), context.clone()).await;
        }
        if let Some(hook) = cache.as_ref().and_then(|c| c.config().on_settled.clone()) {
            hook(
                None,
                Some(error.clone()),
                variables.clone(),
                context.clone(),
                Arc::clone(self),
            )
            .await;
        }
        if let Some(on_settled) = &options.on_settled {
            on_settled(None, Some(error.clone()), variables.clone(), context).await;
        }
    }

    fn build_retryer(&self, variables: &Value) -> Retryer<Value> {
        let options = self.options();
        let mutation_fn = options.mutation_fn.clone();
        let context = MutationFunctionContext {
            mutation_key: options.mutation_key.clone(),
            meta: options.meta.clone(),
        };
        let vars = variables.clone();
        let run: RunFn<Value> = Arc::new(move || match &mutation_fn {
            Some(f) => f(vars.clone(), context.clone()),
            None => future::ready(Err(QueryError::MissingMutationFn)).boxed(),
        });

        let mut config = RetryerConfig::new(run, &self.ambient);
        config.retry = options.retry.clone().unwrap_or(RetryPolicy::Never);
        config.retry_delay = options.retry_delay.clone().unwrap_or_default();
        config.network_mode = options.network_mode.unwrap_or_default();

        let weak = self.me.clone();
        let cache = self.cache.clone();
        config.can_run = Some(Arc::new(move || {
            match (weak.upgrade(), cache.upgrade()) {
                (Some(mutation), Some(cache)) => {
                    MutationCache::from_inner(cache).can_run(&mutation)
                }
                _ => true,
            }
        }));
        let weak = self.me.clone();
        config.on_fail = Some(Arc::new(move |failure_count, error: &QueryError| {
            if let Some(mutation) = weak.upgrade() {
                mutation.dispatch(MutationAction::Failed {
                    failure_count,
                    error: error.clone(),
                });
            }
        }));
        let weak = self.me.clone();
        config.on_pause = Some(Arc::new(move || {
            if let Some(mutation) = weak.upgrade() {
                mutation.dispatch(MutationAction::Pause);
            }
        }));
        let weak = self.me.clone();
        config.on_continue = Some(Arc::new(move || {
            if let Some(mutation) = weak.upgrade() {
                mutation.dispatch(MutationAction::Continue);
            }
        }));

        Retryer::new(config)
    }

    pub(crate) fn dispatch(&self, action: MutationAction) {
        {
            let mut core = self.core.lock();
            core.state = core.state.reduce(&action);
        }
        self.ambient.notify.batch(|| {
            self.notify_cache(|mutation| MutationCacheEvent::Updated { mutation, action });
        });
    }

    fn cache(&self) -> Option<MutationCache> {
        self.cache.upgrade().map(MutationCache::from_inner)
    }

    fn notify_cache(&self, event: impl FnOnce(Arc<Mutation>) -> MutationCacheEvent) {
        if let (Some(cache), Some(this)) = (self.cache(), self.me.upgrade()) {
            cache.notify(event(this));
        }
    }

    /// The scope is free for this mutation; wake it wherever it is parked.
    pub(crate) fn wake_for_scope(&self) {
        self.scope_turn.notify_one();
        let retryer = self.core.lock().retryer.clone();
        if let Some(retryer) = retryer {
            retryer.resume();
        }
    }

    pub(crate) fn schedule_gc(&self) {
        let gc_time = self.core.lock().gc_time;
        let weak = self.me.clone();
        self.gc.schedule(gc_time, move || {
            if let Some(mutation) = weak.upgrade() {
                mutation.optional_remove();
            }
        });
    }

    pub(crate) fn clear_gc(&self) {
        self.gc.clear();
    }

    fn optional_remove(&self) {
        let (unobserved, busy) = {
            let core = self.core.lock();
            (
                core.observers.is_empty(),
                core.state.status == MutationStatus::Pending || core.state.is_queued(),
            )
        };
        if !unobserved {
            return;
        }
        if busy {
            self.schedule_gc();
            return;
        }
        if let (Some(cache), Some(this)) = (self.cache(), self.me.upgrade()) {
            debug!(mutation_id = self.mutation_id, "Collecting finished mutation");
            cache.remove(&this);
        }
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Mutation")
            .field("mutation_id", &self.mutation_id)
            .field("status", &core.state.status)
            .field("is_paused", &core.state.is_paused)
            .field("scope", &core.options.scope)
            .finish()
    }
}
