//! Integration tests for focus and connectivity driven refetching

use querykit::error::QueryError;
use querykit::mutation::{mutation_fn, MutationOptions, MutationStatus};
use querykit::query::{FetchStatus, QueryOptions, RefetchOn, StaleTime};
use querykit::{QueryClient, QueryObserver};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::integration::counting_fn;

/// Lets tasks spawned by a signal handler run to completion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn blur_and_focus(client: &QueryClient) {
    client.ambient().focus.set_focused(Some(false));
    client.ambient().focus.set_focused(Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_focus_refetches_stale_observed_queries() {
    let client = QueryClient::new();
    client.mount();
    let stale_calls = Arc::new(AtomicU32::new(0));
    let fresh_calls = Arc::new(AtomicU32::new(0));

    let stale = QueryObserver::new(
        &client,
        QueryOptions::new("stale").with_query_fn(counting_fn(json!(1), Arc::clone(&stale_calls))),
    );
    let fresh = QueryObserver::new(
        &client,
        QueryOptions::new("fresh")
            .with_query_fn(counting_fn(json!(2), Arc::clone(&fresh_calls)))
            .with_stale_time(StaleTime::Infinite),
    );
    stale.refetch().await.unwrap();
    fresh.refetch().await.unwrap();

    blur_and_focus(&client);
    settle().await;

    assert_eq!(stale_calls.load(Ordering::SeqCst), 2);
    assert_eq!(fresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refetch_policy_per_observer() {
    let client = QueryClient::new();
    client.mount();
    let never_calls = Arc::new(AtomicU32::new(0));
    let always_calls = Arc::new(AtomicU32::new(0));

    let never = QueryObserver::new(
        &client,
        QueryOptions::new("never")
            .with_query_fn(counting_fn(json!(1), Arc::clone(&never_calls)))
            .with_refetch_on_window_focus(false),
    );
    let always = QueryObserver::new(
        &client,
        QueryOptions::new("always")
            .with_query_fn(counting_fn(json!(2), Arc::clone(&always_calls)))
            .with_stale_time(StaleTime::Infinite)
            .with_refetch_on_window_focus(RefetchOn::Always),
    );
    never.refetch().await.unwrap();
    always.refetch().await.unwrap();

    blur_and_focus(&client);
    settle().await;

    assert_eq!(never_calls.load(Ordering::SeqCst), 1);
    assert_eq!(always_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unmounted_client_ignores_signals() {
    let client = QueryClient::new();
    client.mount();
    client.mount();
    let calls = Arc::new(AtomicU32::new(0));
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new("quiet").with_query_fn(counting_fn(json!(1), Arc::clone(&calls))),
    );
    observer.refetch().await.unwrap();

    // Mounts nest; one unmount keeps the subscriptions.
    client.unmount();
    assert!(client.is_mounted());
    blur_and_focus(&client);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    client.unmount();
    assert!(!client.is_mounted());
    blur_and_focus(&client);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_wakes_paused_fetch() {
    let client = QueryClient::new();
    client.mount();
    client.ambient().online.set_online(false);
    let calls = Arc::new(AtomicU32::new(0));
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new("inbox").with_query_fn(counting_fn(json!(["mail"]), Arc::clone(&calls))),
    );

    let fetch = observer.refetch();
    settle().await;
    assert_eq!(observer.state().fetch_status, FetchStatus::Paused);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    client.ambient().online.set_online(true);
    assert_eq!(fetch.await.unwrap(), json!(["mail"]));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(observer.state().fetch_status, FetchStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_paused_mutations() {
    let client = QueryClient::new();
    client.mount();
    client.ambient().online.set_online(false);

    let run = client.mutate(
        MutationOptions::new()
            .with_key("sync")
            .with_mutation_fn(mutation_fn(|vars: Value, _ctx| async move {
                Ok::<_, QueryError>(vars)
            })),
        json!({"dirty": true}),
    );
    settle().await;
    let mutation = client.mutation_cache().get_all().pop().unwrap();
    assert!(mutation.state().is_paused);

    client.ambient().online.set_online(true);
    assert_eq!(run.await.unwrap(), json!({"dirty": true}));
    assert_eq!(mutation.state().status, MutationStatus::Success);
}
