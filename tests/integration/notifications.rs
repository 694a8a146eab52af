//! Integration tests for batched notifications and cache events

use querykit::cache::MutationFilters;
use querykit::error::QueryError;
use querykit::mutation::{mutation_fn, MutationOptions};
use querykit::notify::Callback;
use querykit::query::{FetchStatus, QueryOptions, QueryStatus};
use querykit::{QueryClient, QueryObserver};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::integration::counting_fn;

fn record_events(client: &QueryClient) -> (Arc<Mutex<Vec<String>>>, querykit::subscribable::Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = client.query_cache().subscribe(move |event| {
        sink.lock().unwrap().push(event.kind().to_string());
    });
    (events, subscription)
}

#[test]
fn test_batch_flushes_once() {
    let client = QueryClient::new();
    let flushes = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&flushes);
    client.ambient().notify.set_batch_notify_function(move |flush: Callback| {
        counter.fetch_add(1, Ordering::SeqCst);
        flush();
    });
    let (events, _subscription) = record_events(&client);

    client.ambient().notify.batch(|| {
        for key in ["a", "b", "c"] {
            client.set_query_data(key, |_| Some(json!(key)));
        }
        assert!(events.lock().unwrap().is_empty());
    });

    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    assert_eq!(events.lock().unwrap().len(), 6);

    // Outside a batch every write is flushed on its own.
    client.set_query_data("a", |_| Some(json!("again")));
    assert_eq!(flushes.load(Ordering::SeqCst), 2);

    // An observer sees only the state the batch ends with.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _observer = QueryObserver::subscribe(&client, QueryOptions::new("counter"), move |state| {
        sink.lock().unwrap().push(state.data.clone())
    });
    let before = flushes.load(Ordering::SeqCst);
    client.ambient().notify.batch(|| {
        for i in 1..=3 {
            client.set_query_data("counter", |_| Some(json!(i)));
        }
        assert!(seen.lock().unwrap().is_empty());
    });
    assert_eq!(flushes.load(Ordering::SeqCst), before + 1);
    assert_eq!(*seen.lock().unwrap(), vec![Some(json!(3))]);
}

#[test]
fn test_nested_batches_flush_at_the_outermost() {
    let client = QueryClient::new();
    let notify = client.ambient().notify.clone();
    let (events, _subscription) = record_events(&client);

    notify.batch(|| {
        notify.batch(|| {
            client.set_query_data("inner", |_| Some(json!(1)));
        });
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(notify.depth(), 1);
    });
    assert_eq!(*events.lock().unwrap(), vec!["added", "updated"]);
}

#[test]
fn test_cache_event_kinds() {
    let client = QueryClient::new();
    let (events, subscription) = record_events(&client);

    client.set_query_data("profile", |_| Some(json!({"name": "Ada"})));
    let observer = QueryObserver::new(&client, QueryOptions::new("profile"));
    drop(observer);
    client.remove_queries(querykit::cache::QueryFilters::exact("profile"));

    assert_eq!(
        *events.lock().unwrap(),
        vec!["added", "updated", "observerAdded", "observerRemoved", "removed"]
    );

    drop(subscription);
    client.set_query_data("profile", |_| Some(json!({})));
    assert_eq!(events.lock().unwrap().len(), 5);
}

#[test]
fn test_updater_returning_none_is_silent() {
    let client = QueryClient::new();
    let (events, _subscription) = record_events(&client);

    assert!(client.set_query_data("untouched", |_| None).is_none());
    assert!(events.lock().unwrap().is_empty());
    assert!(client.query_cache().is_empty());
}

#[tokio::test]
async fn test_observer_listener_sees_each_transition() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let observer = QueryObserver::subscribe(
        &client,
        QueryOptions::new("stream").with_query_fn(counting_fn(json!("tick"), Arc::clone(&calls))),
        move |state| sink.lock().unwrap().push((state.status, state.fetch_status)),
    );
    observer.refetch().await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (QueryStatus::Pending, FetchStatus::Fetching),
            (QueryStatus::Success, FetchStatus::Idle),
        ]
    );
}

#[test]
fn test_custom_scheduler_defers_delivery() {
    let client = QueryClient::new();
    let deferred: Arc<Mutex<Vec<Callback>>> = Arc::default();
    let queue = Arc::clone(&deferred);
    client
        .ambient()
        .notify
        .set_scheduler(move |callback: Callback| queue.lock().unwrap().push(callback));
    let (events, _subscription) = record_events(&client);

    client.set_query_data("later", |_| Some(json!(1)));
    assert!(events.lock().unwrap().is_empty());

    let pending: Vec<Callback> = std::mem::take(&mut *deferred.lock().unwrap());
    for callback in pending {
        callback();
    }
    assert_eq!(*events.lock().unwrap(), vec!["added", "updated"]);
}

#[tokio::test]
async fn test_mutation_cache_events() {
    let client = QueryClient::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _subscription = client.mutation_cache().subscribe(move |event| {
        sink.lock().unwrap().push(event.kind().to_string());
    });

    let options = MutationOptions::new()
        .with_key("rename")
        .with_mutation_fn(mutation_fn(|vars: Value, _ctx| async move {
            Ok::<_, QueryError>(vars)
        }));
    client.mutate(options, json!("new name")).await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.first().map(String::as_str), Some("added"));
    assert!(events.iter().skip(1).all(|kind| kind == "updated"));
    assert_eq!(client.is_mutating(MutationFilters::all()), 0);
}
