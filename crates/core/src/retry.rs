//! RetryPolicy: per-task failure counting, backoff, dead-letter decision
//! (spec.md §4.3, §9).
//!
//! Per the design notes, the score penalty for a retried task is carried
//! entirely by `PriorityScorer`'s `-10 * attempts` term; this policy does
//! not apply a second ad-hoc adjustment on top (the source's double-count,
//! flagged as an inherited open question, is deliberately not reproduced).

use std::time::Duration;

/// Failure-handling policy for one task.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

/// What should happen after a task at `attempts` attempts has just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after the given backoff.
    Retry { backoff: Duration },
    /// Exhausted: move to `DeadLettered`.
    DeadLetter,
}

impl RetryPolicy {
    /// Decide what happens after a failure, given the attempt count
    /// *after* this failure has been recorded (i.e. `attempts` already
    /// incremented). `I6`: dead-letter requires `attempts > max_retries`.
    #[must_use]
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if attempts > self.max_retries {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                backoff: self.backoff(attempts),
            }
        }
    }

    /// `baseDelay * 2^attempts`, capped.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_max_then_dead_letters() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..Default::default()
        };
        assert!(matches!(policy.decide(1), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(2), RetryDecision::Retry { .. }));
        assert_eq!(policy.decide(3), RetryDecision::DeadLetter);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(10));
    }
}
