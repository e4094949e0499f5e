pub mod cache;
pub mod config;
pub mod conversation;
pub mod coordinator;
pub mod error;
pub mod fleet;
pub mod kv;
pub mod logging;
pub mod observability;
pub mod platform;
pub mod queue;
pub mod rate_limit;
pub mod reliability;
pub mod store;
pub mod webhook;

pub use cache::Cache;
pub use config::Config;
pub use conversation::ConversationService;
pub use coordinator::{Coordinator, InboundUpdate};
pub use error::{BridgeError, Result};
pub use fleet::{Bot, FleetManager};
pub use kv::Kv;
pub use logging::setup_logging;
pub use observability::{Metrics, ObservabilityServer};
pub use platform::{PlatformClient, TeloxideClient};
pub use queue::{LoadBalancer, PriorityQueue};
pub use rate_limit::RateLimitEngine;
pub use reliability::{CircuitBreakerRegistry, FailoverManager, RetryPolicy};
pub use store::Store;
pub use webhook::WebhookServer;
