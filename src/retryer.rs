//! Cancellable, backoff-aware execution of one attempt sequence.
//!
//! A [`Retryer`] runs a unit of work on the Tokio runtime, retrying failures according
//! to its [`RetryPolicy`] and [`RetryDelay`]. While the network gate is closed it parks
//! in a paused state until [`Retryer::resume`] finds the gate open again. The outcome is
//! published exactly once through a shared future.

use crate::ambient::Ambient;
use crate::error::{CancelledError, QueryError};
use crate::signals::{FocusManager, OnlineManager};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The unit of work retried by a [`Retryer`].
pub type RunFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Outcome shared by every party awaiting an attempt sequence.
pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T, QueryError>>>;

/// When work may run with respect to connectivity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkMode {
    /// Run only while online.
    #[default]
    Online,
    /// Ignore connectivity entirely.
    Always,
    /// Start immediately, pause retries while offline.
    OfflineFirst,
}

impl NetworkMode {
    /// Whether a fresh attempt may start right now.
    pub fn can_fetch(self, online: &OnlineManager) -> bool {
        match self {
            NetworkMode::Online => online.is_online(),
            NetworkMode::Always | NetworkMode::OfflineFirst => true,
        }
    }
}

/// Whether a failed attempt is retried.
#[derive(Clone)]
pub enum RetryPolicy {
    Never,
    Always,
    /// Retry while fewer than this many retries have happened.
    Count(u32),
    /// Decide from the number of failures so far and the latest error.
    Predicate(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
}

impl RetryPolicy {
    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Always => true,
            RetryPolicy::Count(max) => failure_count < *max,
            RetryPolicy::Predicate(f) => f(failure_count, error),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Never => write!(f, "Never"),
            RetryPolicy::Always => write!(f, "Always"),
            RetryPolicy::Count(n) => write!(f, "Count({})", n),
            RetryPolicy::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

impl From<u32> for RetryPolicy {
    fn from(count: u32) -> Self {
        RetryPolicy::Count(count)
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry {
            RetryPolicy::Always
        } else {
            RetryPolicy::Never
        }
    }
}

/// How long to wait before the next attempt.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// `min(1000 * 2^failures, 30000)` milliseconds.
    #[default]
    Exponential,
    Fixed(Duration),
    Custom(Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>),
}

impl RetryDelay {
    pub fn delay_for(&self, failure_count: u32, error: &QueryError) -> Duration {
        match self {
            RetryDelay::Exponential => default_retry_delay(failure_count),
            RetryDelay::Fixed(d) => *d,
            RetryDelay::Custom(f) => f(failure_count, error),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Exponential => write!(f, "Exponential"),
            RetryDelay::Fixed(d) => write!(f, "Fixed({:?})", d),
            RetryDelay::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Capped exponential backoff without jitter.
pub fn default_retry_delay(failure_count: u32) -> Duration {
    let ms = 1000u64
        .saturating_mul(2u64.saturating_pow(failure_count))
        .min(30_000);
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryerStatus {
    Pending,
    Resolved,
    Rejected,
}

type Hook = Arc<dyn Fn() + Send + Sync>;
type SettledHook<T> = Box<dyn FnOnce(&Result<T, QueryError>) + Send>;

/// Everything a [`Retryer`] needs. Hooks are optional.
pub struct RetryerConfig<T> {
    pub run: RunFn<T>,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    /// Extra gate on top of connectivity, e.g. mutation scope exclusion.
    pub can_run: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    pub on_fail: Option<Arc<dyn Fn(u32, &QueryError) + Send + Sync>>,
    pub on_pause: Option<Hook>,
    pub on_continue: Option<Hook>,
    /// Runs synchronously inside [`Retryer::cancel`], before the rejection is published.
    pub on_cancel: Option<Arc<dyn Fn(CancelledError) + Send + Sync>>,
    /// Runs once with the final outcome, before any waiter observes it.
    pub on_settled: Option<SettledHook<T>>,
    /// Signalled when the sequence is cancelled.
    pub abort: CancellationToken,
    pub focus: FocusManager,
    pub online: OnlineManager,
}

impl<T> RetryerConfig<T> {
    /// Defaults: exponential delay, online mode, and the environment's query retry count.
    pub fn new(run: RunFn<T>, ambient: &Ambient) -> Self {
        Self {
            run,
            retry: RetryPolicy::Count(ambient.environment.default_query_retries()),
            retry_delay: RetryDelay::default(),
            network_mode: NetworkMode::default(),
            can_run: None,
            on_fail: None,
            on_pause: None,
            on_continue: None,
            on_cancel: None,
            on_settled: None,
            abort: CancellationToken::new(),
            focus: ambient.focus.clone(),
            online: ambient.online.clone(),
        }
    }
}

struct Control<T> {
    status: RetryerStatus,
    started: bool,
    retry_cancelled: bool,
    failure_count: u32,
    sender: Option<oneshot::Sender<Result<T, QueryError>>>,
    on_settled: Option<SettledHook<T>>,
}

struct Claim<T> {
    sender: Option<oneshot::Sender<Result<T, QueryError>>>,
    on_settled: Option<SettledHook<T>>,
}

struct RetryerShared<T> {
    control: Mutex<Control<T>>,
    wake: Notify,
    promise: SharedResult<T>,
    run: RunFn<T>,
    retry: RetryPolicy,
    retry_delay: RetryDelay,
    network_mode: NetworkMode,
    can_run: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    on_fail: Option<Arc<dyn Fn(u32, &QueryError) + Send + Sync>>,
    on_pause: Option<Hook>,
    on_continue: Option<Hook>,
    on_cancel: Option<Arc<dyn Fn(CancelledError) + Send + Sync>>,
    abort: CancellationToken,
    focus: FocusManager,
    online: OnlineManager,
}

/// Handle to one attempt sequence. Clones share the sequence.
pub struct Retryer<T> {
    shared: Arc<RetryerShared<T>>,
}

impl<T> Clone for Retryer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Retryer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: RetryerConfig<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let promise = async move {
            rx.await
                .unwrap_or_else(|_| Err(QueryError::Cancelled(CancelledError::default())))
        }
        .boxed()
        .shared();

        Self {
            shared: Arc::new(RetryerShared {
                control: Mutex::new(Control {
                    status: RetryerStatus::Pending,
                    started: false,
                    retry_cancelled: false,
                    failure_count: 0,
                    sender: Some(tx),
                    on_settled: config.on_settled,
                }),
                wake: Notify::new(),
                promise,
                run: config.run,
                retry: config.retry,
                retry_delay: config.retry_delay,
                network_mode: config.network_mode,
                can_run: config.can_run,
                on_fail: config.on_fail,
                on_pause: config.on_pause,
                on_continue: config.on_continue,
                on_cancel: config.on_cancel,
                abort: config.abort,
                focus: config.focus,
                online: config.online,
            }),
        }
    }

    /// Spawn the attempt loop (once) and return the shared outcome.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> SharedResult<T> {
        let first = {
            let mut control = self.shared.control.lock();
            !std::mem::replace(&mut control.started, true)
        };
        if first {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = shared.abort.cancelled() => Err(QueryError::Cancelled(CancelledError::default())),
                    outcome = shared.attempts() => outcome,
                };
                shared.settle(outcome);
            });
        }
        self.shared.promise.clone()
    }

    pub fn promise(&self) -> SharedResult<T> {
        self.shared.promise.clone()
    }

    pub fn status(&self) -> RetryerStatus {
        self.shared.control.lock().status
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.is_resolved()
    }

    pub fn failure_count(&self) -> u32 {
        self.shared.control.lock().failure_count
    }

    /// Reject with a cancellation and signal the abort token. No-op once settled.
    pub fn cancel(&self, options: CancelledError) {
        let Some(claim) = self.shared.claim(false) else {
            return;
        };
        debug!(
            revert = options.revert,
            silent = options.silent,
            "Cancelling attempt sequence"
        );
        self.shared.abort.cancel();
        if let Some(on_cancel) = &self.shared.on_cancel {
            on_cancel(options);
        }
        self.shared
            .publish(claim, Err(QueryError::Cancelled(options)));
    }

    /// A pending retry will give up once its delay elapses.
    pub fn cancel_retry(&self) {
        self.shared.control.lock().retry_cancelled = true;
    }

    pub fn continue_retry(&self) {
        self.shared.control.lock().retry_cancelled = false;
    }

    /// Wake a paused sequence; it continues only if its gate is open.
    pub fn resume(&self) {
        self.shared.wake.notify_one();
    }

    pub fn can_start(&self) -> bool {
        self.shared.can_start()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> RetryerShared<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn is_resolved(&self) -> bool {
        self.control.lock().status != RetryerStatus::Pending
    }

    fn is_retry_cancelled(&self) -> bool {
        self.control.lock().retry_cancelled
    }

    fn gate_open(&self) -> bool {
        self.can_run.as_ref().map_or(true, |f| f())
    }

    fn can_start(&self) -> bool {
        self.network_mode.can_fetch(&self.online) && self.gate_open()
    }

    fn can_continue(&self) -> bool {
        self.focus.is_focused()
            && (self.network_mode == NetworkMode::Always || self.online.is_online())
            && self.gate_open()
    }

    async fn pause(&self) {
        if let Some(on_pause) = &self.on_pause {
            on_pause();
        }
        while !(self.is_resolved() || self.can_continue()) {
            self.wake.notified().await;
        }
        if !self.is_resolved() {
            if let Some(on_continue) = &self.on_continue {
                on_continue();
            }
        }
    }

    async fn attempts(&self) -> Result<T, QueryError> {
        if !self.can_start() {
            self.pause().await;
        }

        let mut failure_count = 0u32;
        loop {
            let error = match (self.run)().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if self.is_retry_cancelled() || !self.retry.should_retry(failure_count, &error) {
                return Err(error);
            }

            let delay = self.retry_delay.delay_for(failure_count, &error);
            failure_count += 1;
            self.control.lock().failure_count = failure_count;
            if let Some(on_fail) = &self.on_fail {
                on_fail(failure_count, &error);
            }
            debug!(
                failure_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );

            tokio::time::sleep(delay).await;
            if !self.can_continue() {
                self.pause().await;
            }
            if self.is_retry_cancelled() {
                return Err(error);
            }
        }
    }

    fn claim(&self, succeeded: bool) -> Option<Claim<T>> {
        let mut control = self.control.lock();
        if control.status != RetryerStatus::Pending {
            return None;
        }
        control.status = if succeeded {
            RetryerStatus::Resolved
        } else {
            RetryerStatus::Rejected
        };
        Some(Claim {
            sender: control.sender.take(),
            on_settled: control.on_settled.take(),
        })
    }

    fn publish(&self, claim: Claim<T>, outcome: Result<T, QueryError>) {
        self.wake.notify_one();
        if let Some(on_settled) = claim.on_settled {
            on_settled(&outcome);
        }
        if let Some(sender) = claim.sender {
            let _ = sender.send(outcome);
        }
    }

    fn settle(&self, outcome: Result<T, QueryError>) {
        if let Some(claim) = self.claim(outcome.is_ok()) {
            self.publish(claim, outcome);
        }
    }
}
