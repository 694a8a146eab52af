//! Per-query configuration and the context handed to query functions.

use crate::error::QueryError;
use crate::gc::GcTime;
use crate::key::{hash_key_with, KeyHashFn, QueryHash, QueryKey};
use crate::retryer::{NetworkMode, RetryDelay, RetryPolicy};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Produces the data for a query.
pub type QueryFn =
    Arc<dyn Fn(QueryFunctionContext) -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;

/// Wrap a typed async function as a [`QueryFn`].
///
/// The result is serialized into the cache. A value that cannot be represented, or one
/// that serializes to null (`()`, `None`), is rejected with [`QueryError::InvalidData`]
/// when the query runs and goes through the retry policy like any other failure.
pub fn query_fn<T, F, Fut>(f: F) -> QueryFn
where
    T: Serialize + Send,
    F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
{
    Arc::new(move |ctx: QueryFunctionContext| {
        let query_hash = ctx.query_hash.clone();
        let fut = f(ctx);
        async move {
            let value = fut.await?;
            serde_json::to_value(&value).map_err(|e| QueryError::InvalidData {
                query_hash,
                reason: e.to_string(),
            })
        }
        .boxed()
    })
}

/// What a query function sees.
#[derive(Clone)]
pub struct QueryFunctionContext {
    pub query_key: QueryKey,
    pub query_hash: QueryHash,
    pub meta: Option<Value>,
    pub page_param: Option<Value>,
    signal: CancellationToken,
    signal_consumed: Arc<AtomicBool>,
}

impl QueryFunctionContext {
    pub(crate) fn new(
        query_key: QueryKey,
        query_hash: QueryHash,
        meta: Option<Value>,
        signal: CancellationToken,
        signal_consumed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            query_key,
            query_hash,
            meta,
            page_param: None,
            signal,
            signal_consumed,
        }
    }

    /// Cancellation token for this fetch.
    ///
    /// Taking the token marks the fetch as abortable: when the last observer goes
    /// away the fetch is cancelled instead of being left to finish.
    pub fn signal(&self) -> CancellationToken {
        self.signal_consumed.store(true, Ordering::SeqCst);
        self.signal.clone()
    }
}

impl fmt::Debug for QueryFunctionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFunctionContext")
            .field("query_key", &self.query_key)
            .field("query_hash", &self.query_hash)
            .field("meta", &self.meta)
            .finish()
    }
}

/// How long fetched data counts as fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleTime {
    After(Duration),
    /// Fresh until invalidated.
    Infinite,
    /// Fresh forever; invalidation and refetching skip it.
    Static,
}

impl Default for StaleTime {
    fn default() -> Self {
        StaleTime::After(Duration::ZERO)
    }
}

/// Refetch policy for focus and reconnect events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefetchOn {
    Never,
    #[default]
    IfStale,
    Always,
}

impl From<bool> for RefetchOn {
    fn from(value: bool) -> Self {
        if value {
            RefetchOn::IfStale
        } else {
            RefetchOn::Never
        }
    }
}

/// Options for a single fetch call.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Cancel an in-flight fetch (if the query already has data) and start over.
    pub cancel_refetch: bool,
    pub meta: Option<Value>,
}

/// Query configuration. Unset fields fall back to per-key and client defaults.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub query_key: Option<QueryKey>,
    pub query_hash: Option<QueryHash>,
    pub query_key_hash_fn: Option<KeyHashFn>,
    pub query_fn: Option<QueryFn>,
    pub enabled: Option<bool>,
    pub stale_time: Option<StaleTime>,
    pub gc_time: Option<GcTime>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub refetch_on_window_focus: Option<RefetchOn>,
    pub refetch_on_reconnect: Option<RefetchOn>,
    pub initial_data: Option<Value>,
    pub initial_data_updated_at: Option<i64>,
    pub meta: Option<Value>,
    pub suspense: Option<bool>,
    pub throw_on_error: Option<bool>,
    /// `ensure_query_data` refreshes stale cached data in the background.
    pub revalidate_if_stale: Option<bool>,
    pub(crate) defaulted: bool,
}

macro_rules! overlay {
    ($base:expr, $over:expr, [$($field:ident),* $(,)?]) => {
        $(
            if $over.$field.is_some() {
                $base.$field = $over.$field.clone();
            }
        )*
    };
}

impl QueryOptions {
    pub fn new(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Fields set on `over` win.
    pub fn merge(&self, over: &QueryOptions) -> QueryOptions {
        let mut merged = self.clone();
        overlay!(
            merged,
            over,
            [
                query_key,
                query_hash,
                query_key_hash_fn,
                query_fn,
                enabled,
                stale_time,
                gc_time,
                retry,
                retry_delay,
                network_mode,
                refetch_on_window_focus,
                refetch_on_reconnect,
                initial_data,
                initial_data_updated_at,
                meta,
                suspense,
                throw_on_error,
                revalidate_if_stale,
            ]
        );
        merged.defaulted = self.defaulted || over.defaulted;
        merged
    }

    pub fn with_query_fn(mut self, query_fn: QueryFn) -> Self {
        self.query_fn = Some(query_fn);
        self
    }

    pub fn with_key_hash_fn(mut self, hash_fn: KeyHashFn) -> Self {
        self.query_key_hash_fn = Some(hash_fn);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_stale_time(mut self, stale_time: StaleTime) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_gc_time(mut self, gc_time: GcTime) -> Self {
        self.gc_time = Some(gc_time);
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

    pub fn with_refetch_on_window_focus(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.refetch_on_window_focus = Some(refetch.into());
        self
    }

    pub fn with_refetch_on_reconnect(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.refetch_on_reconnect = Some(refetch.into());
        self
    }

    pub fn with_initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn with_initial_data_updated_at(mut self, updated_at: i64) -> Self {
        self.initial_data_updated_at = Some(updated_at);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = Some(throw_on_error);
        self
    }

    pub fn with_revalidate_if_stale(mut self, revalidate: bool) -> Self {
        self.revalidate_if_stale = Some(revalidate);
        self
    }

    pub fn is_defaulted(&self) -> bool {
        self.defaulted
    }

    /// The key, or `[]` when none was given.
    pub fn resolved_key(&self) -> QueryKey {
        self.query_key
            .clone()
            .unwrap_or_else(|| QueryKey::new(Value::Array(Vec::new())))
    }

    /// The explicit hash, or one derived from the key.
    pub fn resolved_hash(&self) -> QueryHash {
        match &self.query_hash {
            Some(hash) => hash.clone(),
            None => hash_key_with(&self.resolved_key(), self.query_key_hash_fn.as_ref()),
        }
    }

    pub fn stale_time_or_default(&self) -> StaleTime {
        self.stale_time.unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_key", &self.query_key)
            .field("query_hash", &self.query_hash)
            .field("query_fn", &self.query_fn.as_ref().map(|_| ".."))
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("network_mode", &self.network_mode)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("refetch_on_reconnect", &self.refetch_on_reconnect)
            .field("meta", &self.meta)
            .field("defaulted", &self.defaulted)
            .finish_non_exhaustive()
    }
}
