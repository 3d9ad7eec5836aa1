//! Retry delays for resubscribing after stream failures

use crate::config::BackoffConfig;
use exponential_backoff::Backoff as Schedule;
use std::time::Duration;

/// Counts consecutive failures and yields the delay before the next attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    max_failures: Option<u32>,
    /// Attempts past this one all yield `max_wait`
    last_attempt: u32,
    schedule: Schedule,
}

fn saturating_attempt(config: &BackoffConfig) -> u32 {
    let mut wait = config.min_wait.max(Duration::from_millis(1));
    let mut attempt = 1;
    while config.factor > 1
        && wait < config.max_wait
        && config.factor.checked_pow(attempt + 1).is_some() {
        wait = wait.saturating_mul(config.factor);
        attempt += 1;
    }
    attempt + 1
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let mut schedule = Schedule::new(
            config.max_failures.unwrap_or(u32::MAX),
            config.min_wait,
            Some(config.max_wait),
        );
        schedule.set_factor(config.factor);
        schedule.set_jitter(f32::from(config.jitter_percent.min(100)) / 100.0);
        Self {
            failures: 0,
            max_failures: config.max_failures,
            last_attempt: saturating_attempt(&config),
            schedule,
        }
    }

    /// Consecutive failures recorded since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Forget past failures after the stream made progress
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Record a failure and return the delay before retrying, or `None` once
    /// the configured failure limit is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.max_failures.is_some_and(|max| self.failures >= max) {
            return None;
        }
        self.schedule.next(self.failures.min(self.last_attempt))
    }
}
