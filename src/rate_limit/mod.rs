mod engine;
mod rules;

pub use engine::{LimitDecision, RateLimitEngine};
pub use rules::{LimitType, RateLimitRule};
