//! Backoff for managed transactions.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;
use crate::error::DriverError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retrying stops once this much time has passed since the first failure.
    pub max_retry_time: Duration,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_time: Duration::from_secs(30),
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            max_retry_time: config.max_transaction_retry_time,
            initial_delay: config.initial_retry_delay,
            multiplier: config.retry_delay_multiplier,
        }
    }
}

/// Tracks one managed transaction's failures and decides whether and when
/// to try again.
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    first_failure: Option<Instant>,
    next_delay: Duration,
    retries: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            first_failure: None,
            next_delay: policy.initial_delay,
            retries: 0,
        }
    }

    /// How long to wait before retrying after `err`, or `None` if the error
    /// must be surfaced: not retryable, or the time budget is spent.
    pub fn next_delay(&mut self, err: &DriverError) -> Option<Duration> {
        if !err.is_retryable() {
            return None;
        }
        let now = Instant::now();
        let started = *self.first_failure.get_or_insert(now);
        if now.duration_since(started) >= self.policy.max_retry_time {
            return None;
        }

        let delay = self.next_delay;
        let scaled = self.next_delay.as_secs_f64() * self.policy.multiplier;
        self.next_delay = Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.policy.max_retry_time)
            .min(self.policy.max_retry_time);
        self.retries += 1;
        Some(delay)
    }

    /// Retries granted so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;

    fn transient() -> DriverError {
        DriverError::from_server_error(ServerError::new(
            "Neo.TransientError.Transaction.DeadlockDetected",
            "deadlock",
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn delays_grow_until_budget_is_spent() {
        let mut state = RetryState::new(RetryPolicy::default());
        let mut delays = Vec::new();
        while let Some(delay) = state.next_delay(&transient()) {
            delays.push(delay);
            tokio::time::advance(delay).await;
        }
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(state.retries(), 5);
    }

    #[test]
    fn non_retryable_errors_stop_immediately() {
        let mut state = RetryState::new(RetryPolicy::default());
        let syntax = DriverError::from_server_error(ServerError::new(
            "Neo.ClientError.Statement.SyntaxError",
            "bad",
        ));
        assert_eq!(state.next_delay(&syntax), None);
        assert_eq!(
            state.next_delay(&DriverError::IncompleteCommit("lost".into())),
            None
        );
        assert_eq!(state.next_delay(&transient()), Some(Duration::from_secs(1)));
    }

    #[test]
    fn zero_budget_never_retries() {
        let mut state = RetryState::new(RetryPolicy {
            max_retry_time: Duration::ZERO,
            ..Default::default()
        });
        assert_eq!(state.next_delay(&transient()), None);
    }
}
