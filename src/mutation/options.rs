//! Mutation configuration and lifecycle hooks.

use crate::error::QueryError;
use crate::gc::GcTime;
use crate::key::QueryKey;
use crate::retryer::{NetworkMode, RetryDelay, RetryPolicy};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Performs the write.
pub type MutationFn = Arc<
    dyn Fn(Value, MutationFunctionContext) -> BoxFuture<'static, Result<Value, QueryError>>
        + Send
        + Sync,
>;

/// Runs before the write; its value becomes the mutation's `context`.
pub type OnMutate =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Option<Value>, QueryError>> + Send + Sync>;
/// `(data, variables, context)`
pub type OnMutationSuccess =
    Arc<dyn Fn(Value, Value, Option<Value>) -> BoxFuture<'static, ()> + Send + Sync>;
/// `(error, variables, context)`
pub type OnMutationError =
    Arc<dyn Fn(QueryError, Value, Option<Value>) -> BoxFuture<'static, ()> + Send + Sync>;
/// `(data, error, variables, context)`
pub type OnMutationSettled = Arc<
    dyn Fn(Option<Value>, Option<QueryError>, Value, Option<Value>) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// Wrap a typed async function as a [`MutationFn`].
pub fn mutation_fn<V, T, F, Fut>(f: F) -> MutationFn
where
    V: DeserializeOwned,
    T: Serialize + Send,
    F: Fn(V, MutationFunctionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
{
    Arc::new(move |variables: Value, ctx: MutationFunctionContext| {
        let fut = serde_json::from_value::<V>(variables)
            .map(|vars| f(vars, ctx))
            .map_err(|e| QueryError::Decode(format!("mutation variables: {}", e)));
        async move {
            let value = fut?.await?;
            serde_json::to_value(&value)
                .map_err(|e| QueryError::Decode(format!("mutation result: {}", e)))
        }
        .boxed()
    })
}

#[derive(Debug, Clone)]
pub struct MutationFunctionContext {
    pub mutation_key: Option<QueryKey>,
    pub meta: Option<Value>,
}

/// Mutations sharing a scope id run one at a time, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationScope {
    pub id: String,
}

impl MutationScope {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Clone, Default)]
pub struct MutationOptions {
    pub mutation_key: Option<QueryKey>,
    pub mutation_fn: Option<MutationFn>,
    pub scope: Option<MutationScope>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub gc_time: Option<GcTime>,
    pub meta: Option<Value>,
    pub on_mutate: Option<OnMutate>,
    pub on_success: Option<OnMutationSuccess>,
    pub on_error: Option<OnMutationError>,
    pub on_settled: Option<OnMutationSettled>,
    pub(crate) defaulted: bool,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    pub fn with_mutation_fn(mut self, mutation_fn: MutationFn) -> Self {
        self.mutation_fn = Some(mutation_fn);
        self
    }

    pub fn with_scope(mut self, id: impl Into<String>) -> Self {
        self.scope = Some(MutationScope::new(id));
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn with_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    pub fn with_gc_time(mut self, gc_time: GcTime) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_on_mutate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, QueryError>> + Send + 'static,
    {
        self.on_mutate = Some(Arc::new(move |vars| f(vars).boxed()));
        self
    }

    pub fn with_on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value, Value, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_success = Some(Arc::new(move |data, vars, ctx| f(data, vars, ctx).boxed()));
        self
    }

    pub fn with_on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(QueryError, Value, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |err, vars, ctx| f(err, vars, ctx).boxed()));
        self
    }

    pub fn with_on_settled<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<Value>, Option<QueryError>, Value, Option<Value>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_settled = Some(Arc::new(move |data, err, vars, ctx| {
            f(data, err, vars, ctx).boxed()
        }));
        self
    }

    /// Fields set on `over` win.
    pub fn merge(&self, over: &MutationOptions) -> MutationOptions {
        let mut merged = self.clone();
        macro_rules! take {
            ($($field:ident),*) => {
                $(
                    if over.$field.is_some() {
                        merged.$field = over.$field.clone();
                    }
                )*
            };
        }
        take!(
            mutation_key,
            mutation_fn,
            scope,
            retry,
            retry_delay,
            network_mode,
            gc_time,
            meta,
            on_mutate,
            on_success,
            on_error,
            on_settled
        );
        merged.defaulted = self.defaulted || over.defaulted;
        merged
    }

    pub fn scope_id(&self) -> Option<&str> {
        self.scope.as_ref().map(|s| s.id.as_str())
    }
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("mutation_key", &self.mutation_key)
            .field("scope", &self.scope)
            .field("retry", &self.retry)
            .field("network_mode", &self.network_mode)
            .field("gc_time", &self.gc_time)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}
