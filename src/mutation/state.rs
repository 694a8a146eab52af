//! Mutation state and its transition function.

use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct MutationState {
    pub context: Option<Value>,
    pub data: Option<Value>,
    pub error: Option<QueryError>,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub is_paused: bool,
    pub status: MutationStatus,
    pub variables: Option<Value>,
    pub submitted_at: i64,
}

#[derive(Debug, Clone)]
pub enum MutationAction {
    /// Waiting for an earlier mutation in the same scope.
    Queued { variables: Value },
    Pending {
        variables: Value,
        context: Option<Value>,
        is_paused: bool,
        submitted_at: i64,
    },
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
    Success { data: Value },
    Error { error: QueryError },
}

impl MutationAction {
    pub fn name(&self) -> &'static str {
        match self {
            MutationAction::Queued { .. } => "queued",
            MutationAction::Pending { .. } => "pending",
            MutationAction::Failed { .. } => "failed",
            MutationAction::Pause => "pause",
            MutationAction::Continue => "continue",
            MutationAction::Success { .. } => "success",
            MutationAction::Error { .. } => "error",
        }
    }
}

impl MutationState {
    /// Parked behind another mutation of its scope, not yet started.
    pub fn is_queued(&self) -> bool {
        self.status == MutationStatus::Idle && self.is_paused
    }

    pub fn reduce(&self, action: &MutationAction) -> MutationState {
        let mut next = self.clone();
        match action {
            MutationAction::Queued { variables } => {
                next.variables = Some(variables.clone());
                next.is_paused = true;
                next.status = MutationStatus::Idle;
            }
            MutationAction::Pending {
                variables,
                context,
                is_paused,
                submitted_at,
            } => {
                next.context = context.clone();
                next.data = None;
                next.error = None;
                next.failure_count = 0;
                next.failure_reason = None;
                next.is_paused = *is_paused;
                next.status = MutationStatus::Pending;
                next.variables = Some(variables.clone());
                next.submitted_at = *submitted_at;
            }
            MutationAction::Failed {
                failure_count,
                error,
            } => {
                next.failure_count = *failure_count;
                next.failure_reason = Some(error.clone());
            }
            MutationAction::Pause => next.is_paused = true,
            MutationAction::Continue => next.is_paused = false,
            MutationAction::Success { data } => {
                next.data = Some(data.clone());
                next.failure_count = 0;
                next.failure_reason = None;
                next.error = None;
                next.status = MutationStatus::Success;
                next.is_paused = false;
            }
            MutationAction::Error { error } => {
                next.data = None;
                next.error = Some(error.clone());
                next.failure_count = self.failure_count + 1;
                next.failure_reason = Some(error.clone());
                next.is_paused = false;
                next.status = MutationStatus::Error;
            }
        }
        next
    }
}
