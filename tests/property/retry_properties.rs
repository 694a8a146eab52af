//! Property-based tests for retry backoff

use proptest::prelude::*;
use querykit::retryer::default_retry_delay;
use std::time::Duration;

/// Test that the default backoff never exceeds thirty seconds
#[test]
fn test_retry_delay_is_capped_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&any::<u32>(), |failures| {
            assert!(default_retry_delay(failures) <= Duration::from_secs(30));
            assert!(default_retry_delay(failures) >= Duration::from_secs(1));
            Ok(())
        })
        .unwrap();
}

/// Test that more failures never shorten the wait
#[test]
fn test_retry_delay_is_monotonic_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(0u32..64, 0u32..64), |(a, b)| {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            assert!(default_retry_delay(low) <= default_retry_delay(high));
            Ok(())
        })
        .unwrap();
}
