use std::sync::Arc;

use prometheus::{Encoder, Gauge, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::info;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::cache::Cache;
use crate::fleet::FleetManager;
use crate::queue::PriorityQueue;
use crate::reliability::FailoverManager;

/// Prometheus registry plus the handful of broker-level gauges/counters that
/// aren't already owned by a component.
pub struct Metrics {
    registry: Registry,
    pub dead_letter_depth: Gauge,
    pub cache_hit_rate: Gauge,
    pub active_bots: Gauge,
    pub coordination_outcomes: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let dead_letter_depth = Gauge::with_opts(Opts::new("broker_dead_letter_depth", "messages in the dead-letter queue"))?;
        registry.register(Box::new(dead_letter_depth.clone()))?;

        let cache_hit_rate = Gauge::with_opts(Opts::new("broker_cache_hit_rate", "rolling cache hit rate"))?;
        registry.register(Box::new(cache_hit_rate.clone()))?;

        let active_bots = Gauge::with_opts(Opts::new("broker_active_bots", "bots currently available"))?;
        registry.register(Box::new(active_bots.clone()))?;

        let coordination_outcomes = IntCounterVec::new(
            Opts::new("broker_coordination_outcomes_total", "coordinator admit/drop decisions"),
            &["outcome"],
        )?;
        registry.register(Box::new(coordination_outcomes.clone()))?;

        Ok(Self { registry, dead_letter_depth, cache_hit_rate, active_bots, coordination_outcomes })
    }

    async fn refresh(&self, fleet: &FleetManager, cache: &Cache, queue: &PriorityQueue) {
        self.active_bots.set(fleet.available_bots().await.len() as f64);
        self.cache_hit_rate.set(cache.stats().await.hit_rate());
        self.dead_letter_depth.set(queue.dead_letter_len().await as f64);
    }

    fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode(&families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Serves `/health`, `/ready`, `/live`, and `/metrics` over a composed
/// `warp` filter chain.
pub struct ObservabilityServer {
    metrics: Arc<Metrics>,
    fleet: Arc<FleetManager>,
    cache: Arc<Cache>,
    queue: Arc<PriorityQueue>,
    failover: Arc<FailoverManager>,
    port: u16,
}

impl ObservabilityServer {
    pub fn new(
        metrics: Arc<Metrics>,
        fleet: Arc<FleetManager>,
        cache: Arc<Cache>,
        queue: Arc<PriorityQueue>,
        failover: Arc<FailoverManager>,
        port: u16,
    ) -> Self {
        Self { metrics, fleet, cache, queue, failover, port }
    }

    pub async fn serve(self) {
        let metrics = self.metrics.clone();
        let fleet = self.fleet.clone();
        let cache = self.cache.clone();
        let queue = self.queue.clone();
        let failover = self.failover.clone();

        let health = warp::path("health").and(warp::get()).and_then({
            let failover = failover.clone();
            move || {
                let failover = failover.clone();
                async move { handle_health(failover).await }
            }
        });

        let ready = warp::path("ready").and(warp::get()).map(|| warp::reply::with_status("OK", StatusCode::OK));
        let live = warp::path("live").and(warp::get()).map(|| warp::reply::with_status("OK", StatusCode::OK));

        let metrics_route = warp::path("metrics").and(warp::get()).and_then(move || {
            let metrics = metrics.clone();
            let fleet = fleet.clone();
            let cache = cache.clone();
            let queue = queue.clone();
            async move {
                metrics.refresh(&fleet, &cache, &queue).await;
                Ok::<_, Rejection>(warp::reply::with_header(metrics.encode(), "content-type", "text/plain; version=0.0.4"))
            }
        });

        let routes = health.or(ready).or(live).or(metrics_route);
        info!(port = self.port, "observability server listening");
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }
}

async fn handle_health(failover: Arc<FailoverManager>) -> Result<impl Reply, Rejection> {
    let active_incidents = failover.active_events().await.len();
    let status = if active_incidents == 0 { "healthy" } else { "degraded" };
    let body = serde_json::json!({"status": status, "active_incidents": active_incidents});
    Ok(warp::reply::json(&body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_registers_without_panicking() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.encode().is_empty() || metrics.encode().contains("broker_"));
    }
}
