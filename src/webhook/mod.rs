use std::sync::Arc;

use serde_json::Value;
use tracing::{error, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::coordinator::{Coordinator, InboundUpdate};

/// Always-200 webhook ingress: one task per inbound update, returning before
/// coordination necessarily finishes so the caller never sees a round-trip
/// failure that would trigger its own retry storm.
pub struct WebhookServer {
    coordinator: Arc<Coordinator>,
    path: String,
    port: u16,
}

impl WebhookServer {
    pub fn new(coordinator: Arc<Coordinator>, path: impl Into<String>, port: u16) -> Self {
        Self { coordinator, path: path.into(), port }
    }

    pub async fn serve(self) {
        let coordinator = self.coordinator.clone();
        let secret_path = self.path.trim_start_matches('/').to_string();

        let route = warp::path(secret_path)
            .and(warp::path::end())
            .and(warp::post())
            .and(warp::body::content_length_limit(1024 * 1024))
            .and(warp::body::json())
            .and_then(move |update: Value| {
                let coordinator = coordinator.clone();
                async move { handle_update(coordinator, update).await }
            });

        let health = warp::path("health").and(warp::get()).map(|| warp::reply::with_status("OK", StatusCode::OK));

        let routes = route.or(health);
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }
}

async fn handle_update(coordinator: Arc<Coordinator>, body: Value) -> Result<impl Reply, Rejection> {
    let update: InboundUpdate = match serde_json::from_value(body) {
        Ok(u) => u,
        Err(e) => {
            warn!(error = %e, "malformed webhook update, rejecting at ingress");
            return Ok(warp::reply::with_status("ignored", StatusCode::OK));
        }
    };

    let coordinator = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = coordinator.coordinate(update).await {
            error!(error = %e, "coordination failed for inbound update");
        }
    });

    Ok(warp::reply::with_status("ok", StatusCode::OK))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_body_is_not_a_panic() {
        let body: Value = serde_json::json!({"not": "an update"});
        let parsed: Result<InboundUpdate, _> = serde_json::from_value(body);
        assert!(parsed.is_err());
    }
}
