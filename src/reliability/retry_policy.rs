use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, used by the coordinator to space out
/// requeues of a failed message.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_range: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_range: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the `attempt`-th retry (0-indexed), with +/- `jitter_range`
    /// of randomness applied to avoid synchronized retries across workers.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(-self.jitter_range..=self.jitter_range);
        let jittered = (capped * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(jittered)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt as usize >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempt_and_stays_capped() {
        let policy = RetryPolicy::default();
        let first = policy.delay_for(0);
        let third = policy.delay_for(5);
        assert!(first <= Duration::from_millis(1200));
        assert!(third <= policy.max_delay + Duration::from_millis(1));
    }

    #[test]
    fn exhausted_trips_at_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted(0));
        assert!(policy.exhausted(3));
    }
}
