//! Property-based tests for query key hashing and partial matching

use proptest::prelude::*;
use querykit::key::{hash_key, partial_match_key, QueryKey};
use serde_json::{Map, Value};

/// Arbitrary JSON values a few levels deep.
fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,4}", inner), 0..4)
                .prop_map(|members| Value::Object(members.into_iter().collect())),
        ]
    })
}

/// Test that hashing the same key twice gives the same hash
#[test]
fn test_hash_determinism_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec(json_value(), 0..4), |parts| {
            let key = QueryKey::new(Value::Array(parts));
            assert_eq!(hash_key(&key), hash_key(&key.clone()));
            Ok(())
        })
        .unwrap();
}

/// Test that object member order never changes the hash
#[test]
fn test_hash_ignores_member_order_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &prop::collection::btree_map("[a-z]{1,6}", json_value(), 0..6),
            |members| {
                let forward: Map<String, Value> = members.clone().into_iter().collect();
                let backward: Map<String, Value> = members.into_iter().rev().collect();

                let a = QueryKey::new(Value::Array(vec![Value::Object(forward)]));
                let b = QueryKey::new(Value::Array(vec![Value::Object(backward)]));
                assert_eq!(hash_key(&a), hash_key(&b));
                Ok(())
            },
        )
        .unwrap();
}

/// Test that equal hashes imply equal keys
#[test]
fn test_hash_distinguishes_keys_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(json_value(), json_value()), |(a, b)| {
            let hash_a = hash_key(&QueryKey::new(Value::Array(vec![a.clone()])));
            let hash_b = hash_key(&QueryKey::new(Value::Array(vec![b.clone()])));
            if hash_a == hash_b {
                assert_eq!(a, b);
            }
            Ok(())
        })
        .unwrap();
}

/// Test that every key matches itself and each of its prefixes
#[test]
fn test_partial_match_prefix_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(prop::collection::vec(json_value(), 0..5), any::<prop::sample::Index>()),
            |(parts, cut)| {
                let full = Value::Array(parts.clone());
                assert!(partial_match_key(&full, &full));

                let len = cut.index(parts.len() + 1);
                let prefix = Value::Array(parts[..len].to_vec());
                assert!(partial_match_key(&full, &prefix));
                Ok(())
            },
        )
        .unwrap();
}

/// Test that a longer filter never matches a shorter key
#[test]
fn test_partial_match_rejects_longer_filter_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(prop::collection::vec(json_value(), 0..4), json_value()),
            |(parts, extra)| {
                let key = Value::Array(parts.clone());
                let mut longer = parts;
                longer.push(extra);
                assert!(!partial_match_key(&key, &Value::Array(longer)));
                Ok(())
            },
        )
        .unwrap();
}
