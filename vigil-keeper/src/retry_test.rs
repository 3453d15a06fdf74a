use std::time::Duration;

use super::retry::RetryPolicy;
use super::signals::Flags;

#[test]
fn sleep_is_bounded_by_the_cap() {
    let mut policy = RetryPolicy::monitor_interactive().with_seed(42);
    policy.start();
    for attempt in 0..1000 {
        let sleep = policy.next_sleep();
        assert!(
            sleep <= Duration::from_millis(5_000),
            "sleep {:?} exceeded the cap on attempt {}",
            sleep,
            attempt
        );
        assert!(
            sleep >= Duration::from_millis(1_000),
            "sleep {:?} fell below the base on attempt {}",
            sleep,
            attempt
        );
    }
}

#[test]
fn sleep_grows_toward_the_cap() {
    // Decorrelated jitter is random, but averaged over many runs the early
    // sleeps must stay below the later ones until the cap dominates.
    let mut first_total = 0u128;
    let mut tenth_total = 0u128;
    for seed in 0..64 {
        let mut policy = RetryPolicy::monitor_interactive().with_seed(seed);
        policy.start();
        first_total += policy.next_sleep().as_millis();
        let mut last = Duration::ZERO;
        for _ in 0..9 {
            last = policy.next_sleep();
        }
        tenth_total += last.as_millis();
    }
    assert!(
        first_total < tenth_total,
        "expected sleeps to grow in expectation, first sum {} vs tenth sum {}",
        first_total,
        tenth_total
    );
}

#[test]
fn main_loop_policy_never_retries() {
    let policy = RetryPolicy::main_loop();
    assert!(!policy.retries(), "the main loop policy must not retry");
}

#[test]
fn expiry_honors_the_attempts_budget() {
    let mut policy = RetryPolicy::interactive(Duration::from_secs(3600)).with_seed(7);
    policy.start();
    let flags = Flags::default();
    // Unbounded attempts: never expires on the counter alone.
    for _ in 0..100 {
        let _ = policy.next_sleep();
    }
    assert!(!policy.expired(&flags));
}

#[test]
fn expiry_honors_the_total_time_budget() {
    let mut policy = RetryPolicy::interactive(Duration::ZERO).with_seed(7);
    policy.start();
    let flags = Flags::default();
    assert!(policy.expired(&flags), "a zero total-time budget expires immediately");
}

#[test]
fn any_signal_expires_the_policy() {
    let mut policy = RetryPolicy::init().with_seed(7);
    policy.start();
    let flags = Flags::default();
    assert!(!policy.expired(&flags));

    flags.request_reload();
    assert!(policy.expired(&flags), "a pending reload must abort the retry loop");

    let flags = Flags::default();
    flags.request_stop();
    assert!(policy.expired(&flags), "a pending stop must abort the retry loop");
}

#[test]
fn restarting_the_policy_resets_the_attempt_state() {
    let mut policy = RetryPolicy::init().with_seed(7);
    policy.start();
    for _ in 0..10 {
        let _ = policy.next_sleep();
    }
    assert!(policy.attempts() == 10);
    policy.start();
    assert!(policy.attempts() == 0, "start() must reset the attempts counter");
}
