//! Integration tests for mutation execution, hooks and scope serialization

use futures::FutureExt;
use querykit::cache::{MutationCacheConfig, MutationFilters};
use querykit::error::QueryError;
use querykit::mutation::{mutation_fn, Mutation, MutationOptions, MutationStatus};
use querykit::QueryClient;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Takes `work` to run and logs its start, finish and success hook.
fn logged_mutation(label: &str, work: Duration, log: &Log) -> MutationOptions {
    let run_log = Arc::clone(log);
    let run_label = label.to_string();
    let hook_log = Arc::clone(log);
    let hook_label = label.to_string();
    MutationOptions::new()
        .with_key(json!(["account", label]))
        .with_mutation_fn(mutation_fn(move |vars: Value, _ctx| {
            let log = Arc::clone(&run_log);
            let label = run_label.clone();
            async move {
                log.lock().unwrap().push(format!("{}:start", label));
                tokio::time::sleep(work).await;
                log.lock().unwrap().push(format!("{}:done", label));
                Ok::<_, QueryError>(vars)
            }
        }))
        .with_on_success(move |_data, _vars, _ctx| {
            let log = Arc::clone(&hook_log);
            let label = hook_label.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                log.lock().unwrap().push(format!("{}:on_success", label));
            }
        })
}

#[tokio::test(start_paused = true)]
async fn test_scoped_mutations_run_one_at_a_time() {
    let client = QueryClient::new();
    let log: Log = Arc::default();

    let first = client.mutate(
        logged_mutation("first", Duration::from_millis(100), &log).with_scope("acct"),
        json!(1),
    );
    let second = client.mutate(
        logged_mutation("second", Duration::from_millis(10), &log).with_scope("acct"),
        json!(2),
    );

    tokio::time::sleep(Duration::from_millis(1)).await;
    let mutations = client.mutation_cache().get_all();
    assert_eq!(mutations[0].state().status, MutationStatus::Pending);
    assert_eq!(mutations[1].state().status, MutationStatus::Idle);
    assert!(mutations[1].state().is_paused);
    assert_eq!(mutations[1].state().variables, Some(json!(2)));

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), json!(1));
    assert_eq!(b.unwrap(), json!(2));
    assert_eq!(
        entries(&log),
        vec![
            "first:start",
            "first:done",
            "first:on_success",
            "second:start",
            "second:done",
            "second:on_success",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_scope_preserves_submission_order() {
    let client = QueryClient::new();
    let log: Log = Arc::default();

    let runs: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|label| {
            client.mutate(
                logged_mutation(label, Duration::from_millis(5), &log).with_scope("queue"),
                json!(label),
            )
        })
        .collect();
    futures::future::join_all(runs).await;

    let starts: Vec<String> = entries(&log)
        .into_iter()
        .filter(|e| e.ends_with(":start"))
        .collect();
    assert_eq!(starts, vec!["a:start", "b:start", "c:start"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scope_holds_across_worker_threads() {
    for round in 0..200 {
        let client = QueryClient::new();
        let running = Arc::new(AtomicU32::new(0));
        let overlaps = Arc::new(AtomicU32::new(0));
        let log: Log = Arc::default();

        let runs: Vec<_> = ["first", "second"]
            .iter()
            .map(|label| {
                let running = Arc::clone(&running);
                let overlaps = Arc::clone(&overlaps);
                let log = Arc::clone(&log);
                let label = label.to_string();
                let options = MutationOptions::new().with_scope("acct").with_mutation_fn(
                    mutation_fn(move |vars: Value, _ctx| {
                        let running = Arc::clone(&running);
                        let overlaps = Arc::clone(&overlaps);
                        let log = Arc::clone(&log);
                        let label = label.clone();
                        async move {
                            if running.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            log.lock().unwrap().push(label);
                            tokio::task::yield_now().await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, QueryError>(vars)
                        }
                    }),
                );
                client.mutate(options, json!(round))
            })
            .collect();
        for outcome in futures::future::join_all(runs).await {
            assert_eq!(outcome.unwrap(), json!(round));
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0, "overlap in round {}", round);
        assert_eq!(entries(&log), vec!["first", "second"], "order in round {}", round);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unscoped_mutations_run_concurrently() {
    let client = QueryClient::new();
    let log: Log = Arc::default();

    let first = client.mutate(logged_mutation("x", Duration::from_millis(100), &log), json!(1));
    let second = client.mutate(logged_mutation("y", Duration::from_millis(100), &log), json!(2));

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(client.is_mutating(MutationFilters::all()), 2);
    assert_eq!(client.is_mutating(MutationFilters::key(json!(["account"]))), 2);
    assert_eq!(
        client.is_mutating(MutationFilters::key(json!(["account", "x"])).with_exact(true)),
        1
    );

    let (a, b) = tokio::join!(first, second);
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(client.is_mutating(MutationFilters::all()), 0);
}

#[tokio::test]
async fn test_error_hooks_receive_context() {
    let log: Log = Arc::default();
    let cache_log = Arc::clone(&log);
    let client = QueryClient::builder()
        .mutation_cache_config(MutationCacheConfig {
            on_error: Some(Arc::new(
                move |error: QueryError, _vars: Value, ctx: Option<Value>, _mutation: Arc<Mutation>| {
                let log = Arc::clone(&cache_log);
                async move {
                    log.lock()
                        .unwrap()
                        .push(format!("cache:{}:{}", error, ctx.unwrap_or_default()));
                }
                .boxed()
            })),
            ..Default::default()
        })
        .build();

    let own_log = Arc::clone(&log);
    let settled_log = Arc::clone(&log);
    let options = MutationOptions::new()
        .with_mutation_fn(mutation_fn(|_vars: Value, _ctx| async {
            Err::<Value, _>(QueryError::msg("conflict"))
        }))
        .with_on_mutate(|vars| async move { Ok(Some(json!({ "optimistic": vars }))) })
        .with_on_error(move |error, _vars, ctx| {
            let log = Arc::clone(&own_log);
            async move {
                log.lock()
                    .unwrap()
                    .push(format!("own:{}:{}", error, ctx.unwrap_or_default()));
            }
        })
        .with_on_settled(move |data, error, _vars, _ctx| {
            let log = Arc::clone(&settled_log);
            async move {
                log.lock()
                    .unwrap()
                    .push(format!("settled:{}:{}", data.is_some(), error.is_some()));
            }
        });

    let err = client.mutate(options, json!(5)).await.unwrap_err();
    assert_eq!(err.to_string(), "conflict");
    assert_eq!(
        entries(&log),
        vec![
            r#"cache:conflict:{"optimistic":5}"#,
            r#"own:conflict:{"optimistic":5}"#,
            "settled:false:true",
        ]
    );

    let mutation = client.mutation_cache().get_all().pop().unwrap();
    let state = mutation.state();
    assert_eq!(state.status, MutationStatus::Error);
    assert_eq!(state.context, Some(json!({"optimistic": 5})));
    assert_eq!(state.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_mutation_retries_when_asked() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let options = MutationOptions::new()
        .with_retry(2u32)
        .with_mutation_fn(mutation_fn(move |vars: Value, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(QueryError::msg("timeout"))
                } else {
                    Ok(vars)
                }
            }
        }));

    assert_eq!(client.mutate(options, json!("ok")).await.unwrap(), json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_mutation_fn() {
    let client = QueryClient::new();
    let err = client.mutate(MutationOptions::new(), json!(null)).await.unwrap_err();
    assert!(matches!(err, QueryError::MissingMutationFn));
}

#[tokio::test(start_paused = true)]
async fn test_offline_mutation_resumes_when_online() {
    let client = QueryClient::new();
    client.ambient().online.set_online(false);
    let log: Log = Arc::default();

    let run = client.mutate(logged_mutation("offline", Duration::from_millis(5), &log), json!(1));
    tokio::time::sleep(Duration::from_millis(1)).await;

    let mutation = client.mutation_cache().get_all().pop().unwrap();
    assert_eq!(mutation.state().status, MutationStatus::Pending);
    assert!(mutation.state().is_paused);
    assert!(entries(&log).is_empty());

    // Resuming is a no-op while still offline.
    client.resume_paused_mutations().await;
    assert!(mutation.state().is_paused);

    client.ambient().online.set_online(true);
    client.resume_paused_mutations().await;
    assert_eq!(run.await.unwrap(), json!(1));
    assert_eq!(mutation.state().status, MutationStatus::Success);
    assert!(!mutation.state().is_paused);
}
