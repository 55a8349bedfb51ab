use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// What to do after a sink failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Replay the same track after the delay. Carries the failure count so far.
    Retry { attempt: u32, after: Duration },
    /// Budget spent: tear the connection down.
    GiveUp,
}

/// Bounded retry budget for one playback attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// `failures` is the count including the failure just observed.
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures >= self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                attempt: failures,
                after: self.backoff,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_budget_is_spent() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1),
            RetryDecision::Retry {
                attempt: 1,
                after: Duration::from_secs(1)
            }
        );
        assert!(matches!(policy.decide(2), RetryDecision::Retry { attempt: 2, .. }));
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
        assert_eq!(policy.decide(4), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_budget_gives_up_immediately() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.decide(1), RetryDecision::GiveUp);
    }
}
