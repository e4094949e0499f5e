#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    SlidingWindow,
    TokenBucket,
    FixedWindow,
}

/// A named rate limit rule, matching the shape the admission query in the
/// rate-limit engine filters against: applicable action types / user groups,
/// plus an optional punishment escalation on repeated denial.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub name: String,
    pub limit_type: LimitType,
    pub max_requests: u32,
    pub window_seconds: u64,
    pub action_types: Vec<String>,
    pub user_groups: Vec<String>,
    pub burst_allowance: u32,
    pub punishment_duration_secs: u64,
    pub enabled: bool,
}

impl RateLimitRule {
    pub fn applies_to(&self, action: &str, group: &str) -> bool {
        self.enabled
            && (self.action_types.is_empty() || self.action_types.iter().any(|a| a == action))
            && (self.user_groups.is_empty() || self.user_groups.iter().any(|g| g == group))
    }

    pub fn key_prefix(&self) -> String {
        format!("ratelimit:{}", self.name)
    }
}
