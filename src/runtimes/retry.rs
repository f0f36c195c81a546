//! Per-task retry policy.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::node::NodeError;

/// Predicate deciding whether a failed attempt is retried.
pub type RetryOn = Arc<dyn Fn(&NodeError) -> bool + Send + Sync>;

/// Exponential-backoff retry policy. Retries preserve task identity, so a
/// retried task's writes land under the same id.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub jitter: bool,
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(128),
            jitter: true,
            // Control-flow bubbles and validation failures are never worth
            // retrying; everything else is assumed transient.
            retry_on: Arc::new(|err| {
                !err.is_bubble() && !matches!(err, NodeError::ValidationFailed(_))
            }),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_interval", &self.initial_interval)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_interval", &self.max_interval)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, err: &NodeError) -> bool {
        attempt < self.max_attempts && (self.retry_on)(err)
    }

    /// Backoff before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.initial_interval.as_secs_f64()
            * self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_interval.as_secs_f64());
        let with_jitter = if self.jitter {
            capped * rand::rng().random_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(with_jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let d1 = policy.delay_for(1);
        let d2 = policy.delay_for(2);
        let d3 = policy.delay_for(3);
        assert!(d1 < d2 && d2 < d3);
        assert!(policy.delay_for(30) <= policy.max_interval);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..32 {
            let d = policy.delay_for(1);
            assert!(d <= policy.initial_interval);
            assert!(d >= policy.initial_interval / 2);
        }
    }

    #[test]
    fn bubbles_are_never_retried() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(1, &NodeError::Cancelled));
        assert!(!policy.should_retry(1, &NodeError::Interrupt(vec![])));
        assert!(policy.should_retry(1, &NodeError::Other("transient".into())));
        assert!(!policy.should_retry(3, &NodeError::Other("exhausted".into())));
    }
}
