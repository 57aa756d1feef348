//! Retry policy for convergence polling. Pure configuration; each poll owns
//! its own `RetryState`.

use std::time::Duration;

/// Attempt cap, delay and escalation for one kind of polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first fetch; total fetches are `max_retries + 1`.
    pub max_retries: u32,
    pub interval: Duration,
    /// Delay multiplier per retry. 1 keeps the interval fixed.
    pub multiplier: u32,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub const fn fixed(max_retries: u32, interval: Duration) -> Self {
        Self { max_retries, interval, multiplier: 1, max_interval: interval }
    }

    pub const fn exponential(max_retries: u32, interval: Duration, multiplier: u32, max_interval: Duration) -> Self {
        Self { max_retries, interval, multiplier, max_interval }
    }

    pub fn state(&self) -> RetryState {
        RetryState { policy: *self, attempt: 0, delay: self.interval }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(5, Duration::from_secs(2))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    RetryAfter(Duration),
    GiveUp { retries: u32 },
}

/// Per-invocation retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    delay: Duration,
}

impl RetryState {
    /// Retries performed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_retries
    }

    /// Decide what to do after an unsatisfied fetch.
    pub fn next_outcome(&mut self) -> RetryOutcome {
        if self.attempt >= self.policy.max_retries {
            return RetryOutcome::GiveUp { retries: self.attempt };
        }
        self.attempt += 1;
        let delay = self.delay;
        self.delay = self.delay.saturating_mul(self.policy.multiplier.max(1)).min(self.policy.max_interval.max(self.policy.interval));
        RetryOutcome::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_retries_then_gives_up() {
        let mut st = RetryPolicy::fixed(5, Duration::from_millis(2000)).state();
        for _ in 0..5 {
            assert_eq!(st.next_outcome(), RetryOutcome::RetryAfter(Duration::from_millis(2000)));
        }
        assert_eq!(st.next_outcome(), RetryOutcome::GiveUp { retries: 5 });
        assert_eq!(st.attempt(), 5);
    }

    #[test]
    fn zero_retries_gives_up_immediately() {
        let mut st = RetryPolicy::fixed(0, Duration::from_secs(1)).state();
        assert_eq!(st.next_outcome(), RetryOutcome::GiveUp { retries: 0 });
    }

    #[test]
    fn exponential_policy_is_capped() {
        let mut st = RetryPolicy::exponential(4, Duration::from_millis(100), 2, Duration::from_millis(300)).state();
        let delays: Vec<_> = (0..4)
            .map(|_| match st.next_outcome() {
                RetryOutcome::RetryAfter(d) => d.as_millis(),
                RetryOutcome::GiveUp { .. } => 0,
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 300, 300]);
    }
}
