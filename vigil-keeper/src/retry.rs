//! Connection retry policies with decorrelated-jitter backoff.
//!
//! The sleep computation follows the "Decorrelated Jitter" variant:
//!
//!   sleep = min(cap, uniform(base, previous_sleep * 3))
//!
//! which spends less total time than full jitter at the cost of a little more
//! load on the monitor.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::signals::Flags;

/// Total retry time budget shared by the long-running policies.
const RETRY_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Base sleep of the default policies.
const RETRY_BASE_SLEEP_MS: u64 = 500;
/// Sleep cap of the default policies.
const RETRY_CAP_SLEEP_MS: u64 = 2_000;

/// A retry policy: how long, how many times, and how to sleep in between.
///
/// `max_attempts` of zero means no retry at all; a negative value means an
/// unbounded number of attempts (within the total time budget).
#[derive(Debug)]
pub struct RetryPolicy {
    max_total_time: Duration,
    max_attempts: i32,
    base_sleep_ms: u64,
    max_sleep_ms: u64,

    started_at: Instant,
    attempts: u32,
    sleep_ms: u64,
    rng: StdRng,
}

impl RetryPolicy {
    fn new(max_total_time: Duration, max_attempts: i32, max_sleep_ms: u64, base_sleep_ms: u64) -> Self {
        Self {
            max_total_time,
            max_attempts,
            base_sleep_ms,
            max_sleep_ms,
            started_at: Instant::now(),
            attempts: 0,
            sleep_ms: base_sleep_ms,
            rng: StdRng::from_entropy(),
        }
    }

    /// The policy of the main keeper loop: no retry. A failure returns
    /// control to the loop, which tries again on its next tick.
    pub fn main_loop() -> Self {
        Self::new(RETRY_TIMEOUT, 0, RETRY_CAP_SLEEP_MS, RETRY_BASE_SLEEP_MS)
    }

    /// The policy of interactive commands: bounded by the configured connect
    /// timeout, unbounded attempts.
    pub fn interactive(connect_timeout: Duration) -> Self {
        Self::new(connect_timeout, -1, RETRY_CAP_SLEEP_MS, RETRY_BASE_SLEEP_MS)
    }

    /// The policy of interactive commands against the monitor: 15 minutes of
    /// total time, unbounded attempts, sleeping between 1 and 5 seconds.
    pub fn monitor_interactive() -> Self {
        Self::new(RETRY_TIMEOUT, -1, 5_000, 1_000)
    }

    /// The registration policy: 15 minutes of total time, unbounded attempts,
    /// sleeps capped at 2 seconds. Provisioning tools may start every node at
    /// once, and the monitor might not be reachable for a while.
    pub fn init() -> Self {
        Self::new(RETRY_TIMEOUT, -1, RETRY_CAP_SLEEP_MS, RETRY_BASE_SLEEP_MS)
    }

    /// Replace the RNG with a seeded one, for deterministic tests.
    #[cfg(test)]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Arm the policy: reset the attempt counter, the sleep state and the
    /// total-time clock. Call before entering a retry loop.
    pub fn start(&mut self) {
        self.started_at = Instant::now();
        self.attempts = 0;
        self.sleep_ms = self.base_sleep_ms;
    }

    /// Whether this policy allows retrying at all.
    pub fn retries(&self) -> bool {
        self.max_attempts != 0
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Compute the next sleep duration and account for the attempt.
    pub fn next_sleep(&mut self) -> Duration {
        let previous = self.sleep_ms;
        let upper = std::cmp::max(self.base_sleep_ms, previous.saturating_mul(3));
        let sleep = self.rng.gen_range(self.base_sleep_ms..=upper);
        self.sleep_ms = std::cmp::min(self.max_sleep_ms, sleep);
        self.attempts += 1;
        Duration::from_millis(self.sleep_ms)
    }

    /// True when we should stop retrying: a pending signal, the total time
    /// budget spent, or the attempts budget spent, whichever comes first.
    pub fn expired(&self, flags: &Flags) -> bool {
        if flags.should_abort() {
            return true;
        }
        if self.started_at.elapsed() >= self.max_total_time {
            return true;
        }
        self.max_attempts > 0 && self.attempts >= self.max_attempts as u32
    }
}
