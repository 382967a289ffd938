//! Backoff policy tests.

use std::time::Duration;

use mcp_hub::internal::transport::{ReconnectPolicy, ReconnectState};

fn policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_secs(1),
        multiplier: 1.5,
        max_delay: Duration::from_secs(30),
        max_attempts,
    }
}

#[test]
fn delay_sequence_grows_geometrically() {
    let policy = policy(10);
    let expected = [1.0f64, 1.5, 2.25, 3.375, 5.0625];
    for (attempt, want) in expected.iter().enumerate() {
        let state = ReconnectState {
            attempt: attempt as u32,
            next_delay: Duration::ZERO,
        };
        let got = policy.next_delay(&state).as_secs_f64();
        assert!(
            (got - want).abs() < 1e-9,
            "attempt {}: got {}, want {}",
            attempt,
            got,
            want
        );
    }
}

#[test]
fn delay_is_capped_at_the_ceiling() {
    let policy = policy(100);
    let state = ReconnectState {
        attempt: 50,
        next_delay: Duration::ZERO,
    };
    assert_eq!(policy.next_delay(&state), Duration::from_secs(30));
}

#[test]
fn huge_attempt_counts_still_return_the_cap() {
    // 2^100 seconds is far past what Duration arithmetic can represent;
    // the cap must win without panicking.
    let policy = ReconnectPolicy {
        base_delay: Duration::from_secs(1),
        multiplier: 2.0,
        max_delay: Duration::from_secs(30),
        max_attempts: 200,
    };
    for attempt in [100, 500, u32::MAX] {
        let state = ReconnectState {
            attempt,
            next_delay: Duration::ZERO,
        };
        assert_eq!(policy.next_delay(&state), Duration::from_secs(30));
    }
}

#[test]
fn should_retry_respects_the_attempt_cap() {
    let policy = policy(3);
    for attempt in 0..3 {
        assert!(policy.should_retry(&ReconnectState {
            attempt,
            next_delay: Duration::ZERO
        }));
    }
    assert!(!policy.should_retry(&ReconnectState {
        attempt: 3,
        next_delay: Duration::ZERO
    }));
}

#[test]
fn zero_attempts_disables_reconnection() {
    let policy = policy(0);
    assert!(!policy.should_retry(&ReconnectState::default()));
}
