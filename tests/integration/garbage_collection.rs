//! Integration tests for garbage collection of unobserved entries

use querykit::ambient::Environment;
use querykit::error::QueryError;
use querykit::gc::GcTime;
use querykit::mutation::{mutation_fn, MutationOptions, MutationStatus};
use querykit::query::QueryOptions;
use querykit::{QueryClient, QueryObserver};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::integration::counting_fn;

fn ten_seconds() -> GcTime {
    GcTime::After(Duration::from_secs(10))
}

#[tokio::test(start_paused = true)]
async fn test_unobserved_query_is_collected() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::new("report")
        .with_query_fn(counting_fn(json!({"rows": 3}), Arc::clone(&calls)))
        .with_gc_time(ten_seconds());

    client.fetch_query(options).await.unwrap();
    assert_eq!(client.query_cache().len(), 1);

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(client.query_cache().len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(client.query_cache().is_empty());
    assert!(client.get_query_data("report").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_observed_query_survives_until_last_observer_leaves() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::new("inbox")
        .with_query_fn(counting_fn(json!(["hello"]), Arc::clone(&calls)))
        .with_gc_time(ten_seconds());

    let first = QueryObserver::new(&client, options.clone());
    let second = QueryObserver::new(&client, options);
    first.refetch().await.unwrap();
    assert_eq!(first.query().observers_count(), 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.query_cache().len(), 1);

    drop(first);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.query_cache().len(), 1);

    drop(second);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(client.query_cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_gc_time_only_grows() {
    let client = QueryClient::new();
    let query = client.query_cache().build(
        &client,
        QueryOptions::new("grow").with_gc_time(ten_seconds()),
        None,
    );
    assert_eq!(query.gc_time(), ten_seconds());

    query.set_options(QueryOptions::new("grow").with_gc_time(GcTime::After(Duration::from_secs(60))));
    assert_eq!(query.gc_time(), GcTime::After(Duration::from_secs(60)));

    query.set_options(QueryOptions::new("grow").with_gc_time(GcTime::After(Duration::from_secs(5))));
    assert_eq!(query.gc_time(), GcTime::After(Duration::from_secs(60)));
}

#[tokio::test(start_paused = true)]
async fn test_server_environment_never_collects() {
    let client = QueryClient::builder()
        .environment(Environment::Server)
        .build();
    client.set_query_data("session", |_| Some(json!({"user": 1})));
    assert_eq!(
        client.query_cache().get_all()[0].gc_time(),
        GcTime::Infinite
    );

    tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
    assert_eq!(client.get_query_data("session"), Some(json!({"user": 1})));
}

#[tokio::test(start_paused = true)]
async fn test_finished_mutation_is_collected() {
    let client = QueryClient::new();
    let options = MutationOptions::new()
        .with_key("save")
        .with_gc_time(GcTime::After(Duration::from_secs(1)))
        .with_mutation_fn(mutation_fn(|vars: Value, _ctx| async move {
            Ok::<_, QueryError>(vars)
        }));

    let result = client.mutate(options, json!({"title": "draft"})).await.unwrap();
    assert_eq!(result, json!({"title": "draft"}));

    let mutation = client.mutation_cache().get_all().pop().unwrap();
    assert_eq!(mutation.state().status, MutationStatus::Success);
    drop(mutation);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(client.mutation_cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_removed_query_stops_collection_timer() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::new("temp")
        .with_query_fn(counting_fn(json!(1), Arc::clone(&calls)))
        .with_gc_time(ten_seconds());
    client.fetch_query(options.clone()).await.unwrap();

    client.remove_queries(querykit::cache::QueryFilters::exact("temp"));
    assert!(client.query_cache().is_empty());

    // A new query under the same key starts its own lifetime.
    client.fetch_query(options).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(client.query_cache().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
