//! Query state and its transition function.

use crate::error::QueryError;
use crate::query::options::{QueryOptions, StaleTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryStatus {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchStatus {
    Idle,
    Fetching,
    Paused,
}

/// Snapshot of one cache entry.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub data: Option<Value>,
    pub data_update_count: u32,
    pub data_updated_at: i64,
    pub error: Option<QueryError>,
    pub error_update_count: u32,
    pub error_updated_at: i64,
    pub fetch_failure_count: u32,
    pub fetch_failure_reason: Option<QueryError>,
    pub fetch_meta: Option<Value>,
    pub is_invalidated: bool,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
}

/// Everything that can happen to a query.
#[derive(Debug, Clone)]
pub enum QueryAction {
    Fetch {
        meta: Option<Value>,
        /// The network gate was closed when the fetch began.
        paused: bool,
    },
    Success {
        data: Value,
        updated_at: i64,
        /// Written through `set_data` rather than produced by a fetch.
        manual: bool,
    },
    Error {
        error: QueryError,
        at: i64,
    },
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
    Invalidate,
    SetState(Box<QueryState>),
}

impl QueryAction {
    pub fn name(&self) -> &'static str {
        match self {
            QueryAction::Fetch { .. } => "fetch",
            QueryAction::Success { .. } => "success",
            QueryAction::Error { .. } => "error",
            QueryAction::Failed { .. } => "failed",
            QueryAction::Pause => "pause",
            QueryAction::Continue => "continue",
            QueryAction::Invalidate => "invalidate",
            QueryAction::SetState(_) => "setState",
        }
    }
}

impl QueryState {
    /// The state a query starts in, seeded from `initial_data` when present.
    pub fn initial(options: &QueryOptions, now: i64) -> Self {
        let data = options.initial_data.clone();
        let has_data = data.is_some();
        Self {
            data,
            data_update_count: 0,
            data_updated_at: if has_data {
                options.initial_data_updated_at.unwrap_or(now)
            } else {
                0
            },
            error: None,
            error_update_count: 0,
            error_updated_at: 0,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            fetch_meta: None,
            is_invalidated: false,
            status: if has_data {
                QueryStatus::Success
            } else {
                QueryStatus::Pending
            },
            fetch_status: FetchStatus::Idle,
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// Stale when there is no data, when invalidated, or once `stale_time` has elapsed.
    /// `Static` data never goes stale; `Infinite` data only through invalidation.
    pub fn is_stale_by_time(&self, stale_time: StaleTime, now: i64) -> bool {
        if self.data.is_none() {
            return true;
        }
        match stale_time {
            StaleTime::Static => false,
            _ if self.is_invalidated => true,
            StaleTime::Infinite => false,
            StaleTime::After(d) => {
                let fresh_until = self
                    .data_updated_at
                    .saturating_add(i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
                now >= fresh_until
            }
        }
    }

    /// Apply `action`. Every variant yields a new state.
    pub fn reduce(&self, action: &QueryAction) -> QueryState {
        let mut next = self.clone();
        match action {
            QueryAction::Fetch { meta, paused } => {
                next.fetch_failure_count = 0;
                next.fetch_failure_reason = None;
                next.fetch_status = if *paused {
                    FetchStatus::Paused
                } else {
                    FetchStatus::Fetching
                };
                if next.data.is_none() {
                    next.error = None;
                    next.status = QueryStatus::Pending;
                }
                next.fetch_meta = meta.clone();
            }
            QueryAction::Success {
                data,
                updated_at,
                manual,
            } => {
                next.data = Some(data.clone());
                next.data_update_count = self.data_update_count + 1;
                next.data_updated_at = *updated_at;
                next.error = None;
                next.is_invalidated = false;
                next.status = QueryStatus::Success;
                if !manual {
                    next.fetch_status = FetchStatus::Idle;
                    next.fetch_failure_count = 0;
                    next.fetch_failure_reason = None;
                }
            }
            QueryAction::Error { error, at } => {
                next.error = Some(error.clone());
                next.error_update_count = self.error_update_count + 1;
                next.error_updated_at = *at;
                next.fetch_failure_count = self.fetch_failure_count + 1;
                next.fetch_failure_reason = Some(error.clone());
                next.fetch_status = FetchStatus::Idle;
                next.status = QueryStatus::Error;
            }
            QueryAction::Failed {
                failure_count,
                error,
            } => {
                next.fetch_failure_count = *failure_count;
                next.fetch_failure_reason = Some(error.clone());
            }
            QueryAction::Pause => next.fetch_status = FetchStatus::Paused,
            QueryAction::Continue => next.fetch_status = FetchStatus::Fetching,
            QueryAction::Invalidate => next.is_invalidated = true,
            QueryAction::SetState(state) => {
                next = (**state).clone();
                if next.status == QueryStatus::Success && next.data.is_none() {
                    next.status = QueryStatus::Pending;
                }
            }
        }
        next
    }
}
