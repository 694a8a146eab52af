//! Serializable snapshots of a client's caches.
//!
//! [`dehydrate`] captures successful queries and paused mutations by default. [`hydrate`]
//! restores a snapshot into another client; existing queries are only overwritten when
//! the snapshot's data is newer. Errors travel as their message and come back as
//! [`QueryError::Hydrated`]. In-flight fetches are not carried across.

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::{QueryHash, QueryKey};
use crate::mutation::{Mutation, MutationOptions, MutationScope, MutationState, MutationStatus};
use crate::query::{FetchStatus, Query, QueryOptions, QueryState, QueryStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedState {
    pub mutations: Vec<DehydratedMutation>,
    pub queries: Vec<DehydratedQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQuery {
    pub query_key: QueryKey,
    pub query_hash: QueryHash,
    pub state: DehydratedQueryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub dehydrated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQueryState {
    #[serde(default)]
    pub data: Option<Value>,
    pub data_update_count: u32,
    pub data_updated_at: i64,
    #[serde(default)]
    pub error: Option<String>,
    pub error_update_count: u32,
    pub error_updated_at: i64,
    pub fetch_failure_count: u32,
    #[serde(default)]
    pub fetch_failure_reason: Option<String>,
    #[serde(default)]
    pub fetch_meta: Option<Value>,
    pub is_invalidated: bool,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
}

impl DehydratedQueryState {
    fn capture(state: &QueryState, data: Option<Value>) -> Self {
        Self {
            data,
            data_update_count: state.data_update_count,
            data_updated_at: state.data_updated_at,
            error: state.error.as_ref().map(ToString::to_string),
            error_update_count: state.error_update_count,
            error_updated_at: state.error_updated_at,
            fetch_failure_count: state.fetch_failure_count,
            fetch_failure_reason: state.fetch_failure_reason.as_ref().map(ToString::to_string),
            fetch_meta: state.fetch_meta.clone(),
            is_invalidated: state.is_invalidated,
            status: state.status,
            fetch_status: state.fetch_status,
        }
    }

    fn restore(&self, data: Option<Value>) -> QueryState {
        let status = match self.status {
            QueryStatus::Success if data.is_none() => QueryStatus::Pending,
            status => status,
        };
        QueryState {
            data,
            data_update_count: self.data_update_count,
            data_updated_at: self.data_updated_at,
            error: self.error.clone().map(QueryError::Hydrated),
            error_update_count: self.error_update_count,
            error_updated_at: self.error_updated_at,
            fetch_failure_count: self.fetch_failure_count,
            fetch_failure_reason: self.fetch_failure_reason.clone().map(QueryError::Hydrated),
            fetch_meta: self.fetch_meta.clone(),
            is_invalidated: self.is_invalidated,
            status,
            fetch_status: self.fetch_status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedMutation {
    #[serde(default)]
    pub mutation_key: Option<QueryKey>,
    pub state: DehydratedMutationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<MutationScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedMutationState {
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub failure_count: u32,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub is_paused: bool,
    pub status: MutationStatus,
    #[serde(default)]
    pub variables: Option<Value>,
    pub submitted_at: i64,
}

impl DehydratedMutationState {
    fn capture(state: &MutationState) -> Self {
        Self {
            context: state.context.clone(),
            data: state.data.clone(),
            error: state.error.as_ref().map(ToString::to_string),
            failure_count: state.failure_count,
            failure_reason: state.failure_reason.as_ref().map(ToString::to_string),
            is_paused: state.is_paused,
            status: state.status,
            variables: state.variables.clone(),
            submitted_at: state.submitted_at,
        }
    }

    fn restore(&self) -> MutationState {
        MutationState {
            context: self.context.clone(),
            data: self.data.clone(),
            error: self.error.clone().map(QueryError::Hydrated),
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone().map(QueryError::Hydrated),
            is_paused: self.is_paused,
            status: self.status,
            variables: self.variables.clone(),
            submitted_at: self.submitted_at,
        }
    }
}

pub type DataTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

#[derive(Clone, Default)]
pub struct DehydrateOptions {
    /// Defaults to successful queries only.
    pub should_dehydrate_query: Option<Arc<dyn Fn(&Query) -> bool + Send + Sync>>,
    /// Defaults to paused mutations only.
    pub should_dehydrate_mutation: Option<Arc<dyn Fn(&Mutation) -> bool + Send + Sync>>,
    pub serialize_data: Option<DataTransform>,
}

#[derive(Clone, Default)]
pub struct HydrateOptions {
    /// Base options for queries created by hydration.
    pub queries: QueryOptions,
    /// Base options for mutations created by hydration.
    pub mutations: MutationOptions,
    pub deserialize_data: Option<DataTransform>,
}

pub fn default_should_dehydrate_query(query: &Query) -> bool {
    query.state().status == QueryStatus::Success
}

pub fn default_should_dehydrate_mutation(mutation: &Mutation) -> bool {
    mutation.state().is_paused
}

/// Snapshot the client's caches.
pub fn dehydrate(client: &QueryClient, options: &DehydrateOptions) -> DehydratedState {
    let dehydrated_at = crate::clock::now_millis();

    let mutations = client
        .mutation_cache()
        .get_all()
        .into_iter()
        .filter(|m| match &options.should_dehydrate_mutation {
            Some(should) => should(m),
            None => default_should_dehydrate_mutation(m),
        })
        .map(|m| {
            let opts = m.options();
            DehydratedMutation {
                mutation_key: opts.mutation_key.clone(),
                state: DehydratedMutationState::capture(&m.state()),
                scope: opts.scope.clone(),
                meta: opts.meta.clone(),
            }
        })
        .collect();

    let queries = client
        .query_cache()
        .get_all()
        .into_iter()
        .filter(|q| match &options.should_dehydrate_query {
            Some(should) => should(q),
            None => default_should_dehydrate_query(q),
        })
        .map(|q| {
            let state = q.state();
            let data = match (&options.serialize_data, state.data.clone()) {
                (Some(serialize), Some(data)) => Some(serialize(data)),
                (_, data) => data,
            };
            DehydratedQuery {
                query_key: q.query_key().clone(),
                query_hash: q.query_hash().clone(),
                state: DehydratedQueryState::capture(&state, data),
                meta: q.meta(),
                dehydrated_at,
            }
        })
        .collect::<Vec<_>>();

    debug!(queries = queries.len(), "Dehydrated query client");
    DehydratedState { mutations, queries }
}

/// Restore a snapshot into `client`.
pub fn hydrate(client: &QueryClient, state: &DehydratedState, options: &HydrateOptions) {
    let mutation_cache = client.mutation_cache();
    for dehydrated in &state.mutations {
        let mut mutation_options = options.mutations.clone();
        mutation_options.mutation_key = dehydrated.mutation_key.clone();
        mutation_options.scope = dehydrated.scope.clone();
        mutation_options.meta = dehydrated.meta.clone();
        mutation_cache.build(client, mutation_options, Some(dehydrated.state.restore()));
    }

    let query_cache = client.query_cache();
    for dehydrated in &state.queries {
        let data = match (&options.deserialize_data, dehydrated.state.data.clone()) {
            (Some(deserialize), Some(data)) => Some(deserialize(data)),
            (_, data) => data,
        };
        let restored = dehydrated.state.restore(data);

        match query_cache.get(&dehydrated.query_hash) {
            Some(query) => {
                let current = query.state();
                if current.data_updated_at < dehydrated.state.data_updated_at {
                    query.set_state(QueryState {
                        fetch_status: current.fetch_status,
                        ..restored
                    });
                }
            }
            None => {
                let mut query_options = options.queries.clone();
                query_options.query_key = Some(dehydrated.query_key.clone());
                query_options.query_hash = Some(dehydrated.query_hash.clone());
                query_options.meta = dehydrated.meta.clone();
                query_cache.build(
                    client,
                    query_options,
                    Some(QueryState {
                        fetch_status: FetchStatus::Idle,
                        ..restored
                    }),
                );
            }
        }
    }
    debug!(
        queries = state.queries.len(),
        mutations = state.mutations.len(),
        "Hydrated query client"
    );
}
