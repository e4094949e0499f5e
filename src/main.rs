use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use support_broker::cache::Cache;
use support_broker::config::Config;
use support_broker::coordinator::Coordinator;
use support_broker::fleet::{Bot, FleetManager};
use support_broker::kv::{Kv, LocalKv, RedisKv};
use support_broker::observability::{Metrics, ObservabilityServer};
use support_broker::platform::TeloxideClient;
use support_broker::queue::{LoadBalancer, PriorityQueue};
use support_broker::rate_limit::RateLimitEngine;
use support_broker::reliability::{CircuitBreakerConfig, CircuitBreakerRegistry, FailoverManager};
use support_broker::store::Store;
use support_broker::webhook::WebhookServer;
use support_broker::{setup_logging, ConversationService};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        if !e.to_string().contains("No such file or directory") {
            warn!("failed to load .env file: {}", e);
        }
    }

    setup_logging()?;

    info!("starting support-broker v{}", env!("CARGO_PKG_VERSION"));
    info!("build {} ({})", env!("GIT_HASH_SHORT"), env!("BUILD_TIME"));

    #[cfg(debug_assertions)]
    warn!("running in debug mode, rebuild with --release for production");

    let config = Config::load()?;
    info!("configuration loaded");

    let store = Arc::new(
        Store::new(&config.store.db_path, config.store.max_connections)
            .await
            .with_context(|| format!("failed to open store at {}", config.store.db_path.display()))?,
    );

    let cache = Arc::new(Cache::new(10_000));
    cache.spawn_sweeper(Duration::from_secs(30));

    let kv: Arc<dyn Kv> = match &config.kv.redis_url {
        Some(url) => match RedisKv::connect(url).await {
            Ok(redis_kv) => {
                info!("connected to redis kv backend");
                Arc::new(redis_kv)
            }
            Err(e) => {
                warn!(error = %e, "redis unreachable, falling back to in-process kv");
                let local = LocalKv::new();
                local.spawn_sweeper(Duration::from_secs(30));
                Arc::new(local)
            }
        },
        None => {
            info!("no redis url configured, using in-process kv");
            let local = LocalKv::new();
            local.spawn_sweeper(Duration::from_secs(30));
            Arc::new(local)
        }
    };

    let platform = Arc::new(TeloxideClient::new(Duration::from_secs(30)));

    let fleet = Arc::new(FleetManager::new(platform.clone(), Some(kv.clone())));
    fleet
        .register(Bot::new("primary", config.platform.bot_token.clone(), 0, 1_800))
        .await;
    for (idx, token) in config.platform.additional_bot_tokens.iter().enumerate() {
        fleet
            .register(Bot::new(format!("secondary-{idx}"), token.clone(), idx as u32 + 1, 1_800))
            .await;
    }
    fleet.clone().spawn_health_probe_loop(Duration::from_secs(30));
    fleet.clone().spawn_status_check_loop();
    fleet.clone().spawn_heartbeat_loop(Duration::from_secs(config.fleet.heartbeat_interval_secs));

    let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));

    let rate_limit_rules = RateLimitEngine::default_rules(
        config.rate_limit.global_requests_per_window,
        config.rate_limit.window_secs,
        config.rate_limit.punishment_duration_secs,
    );
    let rate_limit = Arc::new(RateLimitEngine::new(config.kv.redis_url.as_deref(), rate_limit_rules).await);

    let queue = Arc::new(PriorityQueue::new(config.kv.redis_url.as_deref(), "support_broker:queue").await);
    let balancer = Arc::new(LoadBalancer::new(Duration::from_secs(300)));

    let conversation = Arc::new(ConversationService::new(
        store.clone(),
        cache.clone(),
        platform.clone(),
        config.groups.support_group_id,
    ));

    let failover = Arc::new(FailoverManager::new(
        fleet.clone(),
        config.fleet.failure_threshold,
        Duration::from_secs(config.fleet.recovery_check_interval_secs),
    ));
    if config.fleet.auto_failover_enabled {
        failover.clone().spawn_recovery_loop();
    }

    let coordinator = Arc::new(Coordinator::new(
        kv.clone(),
        queue.clone(),
        balancer,
        fleet.clone(),
        rate_limit,
        conversation,
        circuit_breakers,
        "support-broker-0",
        config.groups.admin_user_ids.clone(),
        config.groups.support_group_id,
    ));
    coordinator.spawn_workers(4);

    let webhook_port = parse_port(&config.webhook.bind_addr).unwrap_or(8081);
    let webhook = WebhookServer::new(coordinator.clone(), config.webhook.path.clone(), webhook_port);
    let webhook_task = tokio::spawn(webhook.serve());

    let observability_task = if config.monitoring.enable_metrics_server {
        let metrics = Arc::new(Metrics::new()?);
        let server = ObservabilityServer::new(
            metrics,
            fleet.clone(),
            cache.clone(),
            queue.clone(),
            failover.clone(),
            config.monitoring.health_check_port,
        );
        Some(tokio::spawn(server.serve()))
    } else {
        None
    };

    info!(port = webhook_port, path = %config.webhook.path, "webhook ingress listening");
    if config.monitoring.enable_metrics_server {
        info!(port = config.monitoring.health_check_port, "observability server listening");
    }
    info!("support-broker is running, press ctrl+c to stop");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = webhook_task => {
            if let Err(e) = result {
                error!(error = %e, "webhook server task panicked");
            }
        }
        Some(result) = conditional_await(observability_task) => {
            if let Err(e) = result {
                error!(error = %e, "observability server task panicked");
            }
        }
    }

    info!("support-broker stopped");
    Ok(())
}

fn parse_port(bind_addr: &str) -> Option<u16> {
    bind_addr.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

async fn conditional_await(task: Option<tokio::task::JoinHandle<()>>) -> Option<std::result::Result<(), tokio::task::JoinError>> {
    match task {
        Some(handle) => Some(handle.await),
        None => std::future::pending().await,
    }
}
