use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub failure_window: Duration,
    pub max_failures_in_window: usize,
    pub recovery_timeout: Duration,
    pub success_threshold: usize,
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            max_failures_in_window: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
}

impl CircuitBreakerStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    last_failure: Option<Instant>,
    state_changed_at: Instant,
    failure_timestamps: Vec<Instant>,
}

/// One breaker for a single named dependency, implementing the
/// CLOSED/OPEN/HALF_OPEN lifecycle. A registry keeps one instance per bot
/// token, per store, per KV connection.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    stats: RwLock<CircuitBreakerStats>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                state_changed_at: Instant::now(),
                failure_timestamps: Vec::new(),
            }),
            stats: RwLock::new(CircuitBreakerStats::default()),
        }
    }

    pub async fn can_execute(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.state_changed_at = Instant::now();
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        let mut stats = self.stats.write().await;
        stats.total_requests += 1;
        stats.successful_requests += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.state_changed_at = Instant::now();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self, dependency: &str) {
        let mut inner = self.inner.write().await;
        let mut stats = self.stats.write().await;
        stats.total_requests += 1;
        stats.failed_requests += 1;

        let now = Instant::now();
        inner.last_failure = Some(now);
        inner.failure_timestamps.push(now);
        let window = self.config.failure_window;
        inner.failure_timestamps.retain(|t| now.duration_since(*t) <= window);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold
                    || inner.failure_timestamps.len() >= self.config.max_failures_in_window
                {
                    inner.state = CircuitState::Open;
                    inner.state_changed_at = now;
                    warn!(dependency, "circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.state_changed_at = now;
                warn!(dependency, "circuit breaker reopened after half-open failure");
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_rejected(&self) {
        self.stats.write().await.rejected_requests += 1;
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        self.stats.read().await.clone()
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.failure_timestamps.clear();
        inner.last_failure = None;
        inner.state_changed_at = Instant::now();
    }
}

/// Registry keyed by dependency name: one breaker per bot token, one for the
/// store, one for the KV, created lazily on first use.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, breakers: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(dependency) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 3, ..Default::default() });
        for _ in 0..3 {
            breaker.record_failure("dep").await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.can_execute().await);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
            success_threshold: 2,
            ..Default::default()
        });
        breaker.record_failure("dep").await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.can_execute().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_reuses_breaker_per_dependency() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a1 = registry.get("bot-1").await;
        a1.record_failure("bot-1").await;
        let a2 = registry.get("bot-1").await;
        assert_eq!(a2.stats().await.failed_requests, 1);
    }
}
