//! Fuzz target for the restart backoff calculation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mongo_bisync::resilience::RetryConfig;
use std::time::Duration;

fuzz_target!(|data: (u32, u32, f64, usize, usize)| {
    let (initial_ms, max_ms, factor, max_attempts, attempt) = data;

    let policy = RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(u64::from(initial_ms)),
        max_delay: Duration::from_millis(u64::from(max_ms)),
        backoff_factor: factor,
        connection_timeout: Duration::from_secs(1),
    };

    // Never panics, even for NaN or negative factors.
    let delay = policy.delay_for_attempt(attempt);
    if attempt > 0 {
        assert!(delay <= policy.max_delay);
    }
    assert_eq!(policy.allows(attempt), attempt <= max_attempts);

    // Bounded work for any attempt count.
    let _ = policy.total_budget();
});
