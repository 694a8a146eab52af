//! Integration tests for fetching: deduplication, retries and cancellation

use futures::FutureExt;
use querykit::ambient::Environment;
use querykit::cache::QueryFilters;
use querykit::error::QueryError;
use querykit::query::{
    query_fn, FetchOptions, FetchStatus, QueryFn, QueryFunctionContext, QueryOptions, QueryStatus,
    StaleTime,
};
use querykit::QueryClient;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::integration::{counting_fn, flaky_fn, slow_fn};

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_share_one_call() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::new(json!(["todos"]))
        .with_query_fn(slow_fn(Duration::from_millis(100), Arc::clone(&calls)));

    let first = client.fetch_query(options.clone());
    let second = client.fetch_query(options);
    let (a, b) = tokio::join!(first, second);

    assert_eq!(a.unwrap(), json!(1));
    assert_eq!(b.unwrap(), json!(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.query_cache().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_success() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::new(json!(["user", 1]))
        .with_query_fn(flaky_fn(2, json!({"name": "Ada"}), Arc::clone(&calls)))
        .with_retry(3u32);

    let data = client.fetch_query(options).await.unwrap();
    assert_eq!(data, json!({"name": "Ada"}));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let state = client.get_query_state(json!(["user", 1])).unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(state.data_update_count, 1);
    assert_eq!(state.fetch_failure_count, 0);
    assert!(state.fetch_failure_reason.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_surface_last_error() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::new("flaky")
        .with_query_fn(flaky_fn(10, json!(null), Arc::clone(&calls)))
        .with_retry(2u32);

    let err = client.fetch_query(options).await.unwrap_err();
    assert_eq!(err.to_string(), "attempt 3 failed");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let state = client.get_query_state("flaky").unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.error_update_count, 1);
    assert!(state.data.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_environment_selects_default_retries() {
    for (environment, expected_calls) in [(Environment::Interactive, 4), (Environment::Server, 1)] {
        let client = QueryClient::builder().environment(environment).build();
        let calls = Arc::new(AtomicU32::new(0));
        let query = client.query_cache().build(
            &client,
            QueryOptions::new("env").with_query_fn(flaky_fn(10, json!(0), Arc::clone(&calls))),
            None,
        );

        let result = query.fetch(None, FetchOptions::default()).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
    }
}

#[tokio::test]
async fn test_fresh_data_is_served_from_cache() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::new("settings")
        .with_query_fn(counting_fn(json!({"theme": "dark"}), Arc::clone(&calls)))
        .with_stale_time(StaleTime::After(Duration::from_secs(60)));

    client.fetch_query(options.clone()).await.unwrap();
    let again = client.fetch_query(options).await.unwrap();

    assert_eq!(again, json!({"theme": "dark"}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ensure_query_data_prefers_cache() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    client.set_query_data("profile", |_| Some(json!({"id": 7})));

    let options = QueryOptions::new("profile").with_query_fn(counting_fn(json!({"id": 8}), Arc::clone(&calls)));
    let data = client.ensure_query_data(options).await.unwrap();

    assert_eq!(data, json!({"id": 7}));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    name: String,
}

#[tokio::test]
async fn test_typed_fetch() {
    let client = QueryClient::new();
    let options = QueryOptions::new(json!(["user", 2])).with_query_fn(query_fn(|ctx| async move {
        let id = ctx.query_key.as_value()[1].clone();
        Ok::<_, QueryError>(json!({ "name": format!("user-{}", id) }))
    }));

    let user: User = client.fetch_query_as(options).await.unwrap();
    assert_eq!(user, User { name: "user-2".to_string() });
    assert_eq!(
        client.get_query_data_as::<User>(json!(["user", 2])).unwrap(),
        Some(User { name: "user-2".to_string() })
    );
}

#[tokio::test]
async fn test_unrepresentable_data_is_rejected() {
    let client = QueryClient::new();
    let options = QueryOptions::new(json!(["broken"])).with_query_fn(query_fn(|_ctx| async {
        let mut by_pair = BTreeMap::new();
        by_pair.insert(vec![1u8, 2], 3u8);
        Ok::<_, QueryError>(by_pair)
    }));

    let err = client.fetch_query(options).await.unwrap_err();
    match err {
        QueryError::InvalidData { query_hash, .. } => {
            assert_eq!(query_hash.as_str(), r#"["broken"]"#)
        }
        other => panic!("expected InvalidData, got {:?}", other),
    }
    assert_eq!(
        client.get_query_state(json!(["broken"])).unwrap().status,
        QueryStatus::Error
    );
}

#[tokio::test]
async fn test_missing_query_fn() {
    let client = QueryClient::new();
    let err = client.fetch_query(QueryOptions::new("orphan")).await.unwrap_err();
    assert!(matches!(err, QueryError::MissingQueryFn { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reverts_to_previous_state() {
    let client = QueryClient::new();
    client.set_query_data("todos", |_| Some(json!(["write tests"])));

    let calls = Arc::new(AtomicU32::new(0));
    let token: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&token);
    let counter = Arc::clone(&calls);
    let options = QueryOptions::new("todos").with_query_fn(query_fn(move |ctx| {
        *seen.lock().unwrap() = Some(ctx.signal());
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, QueryError>(json!(["replaced"]))
        }
    }));

    let fetch = client.fetch_query(options);
    tokio::task::yield_now().await;
    assert_eq!(
        client.get_query_state("todos").unwrap().fetch_status,
        FetchStatus::Fetching
    );

    client.cancel_queries(QueryFilters::key("todos")).await;

    let state = client.get_query_state("todos").unwrap();
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data, Some(json!(["write tests"])));
    assert!(token.lock().unwrap().as_ref().unwrap().is_cancelled());

    // A reverted fetch hands back the data it reverted to.
    assert_eq!(fetch.await.unwrap(), json!(["write tests"]));
}

#[tokio::test(start_paused = true)]
async fn test_refetch_supersedes_in_flight_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let query = client.query_cache().build(
        &client,
        QueryOptions::new("feed").with_query_fn(slow_fn(Duration::from_millis(50), Arc::clone(&calls))),
        None,
    );
    client.set_query_data("feed", |_| Some(json!(0)));

    let first = query.fetch(None, FetchOptions::default());
    tokio::task::yield_now().await;
    let second = query.fetch(
        None,
        FetchOptions {
            cancel_refetch: true,
            meta: None,
        },
    );

    // The superseded caller follows the replacement fetch.
    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), json!(2));
    assert_eq!(b.unwrap(), json!(2));
    assert_eq!(query.state().data, Some(json!(2)));
    assert_eq!(query.state().fetch_status, FetchStatus::Idle);
}

#[tokio::test]
async fn test_null_data_is_rejected() {
    let client = QueryClient::new();
    let raw: QueryFn = Arc::new(|_ctx: QueryFunctionContext| {
        async { Ok::<Value, QueryError>(json!(null)) }.boxed()
    });
    let typed = query_fn(|_ctx| async { Ok::<Option<u32>, QueryError>(None) });

    for (key, query_fn) in [("raw", raw), ("typed", typed)] {
        let err = client
            .fetch_query(QueryOptions::new(key).with_query_fn(query_fn).with_retry(0u32))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidData { .. }), "{}: {:?}", key, err);
        let state = client.get_query_state(key).unwrap();
        assert_eq!(state.status, QueryStatus::Error);
        assert!(state.data.is_none());
    }
}
