use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub platform: PlatformConfig,
    pub groups: GroupsConfig,
    pub fleet: FleetConfig,
    pub rate_limit: RateLimitConfig,
    pub store: StoreConfig,
    pub kv: KvConfig,
    pub webhook: WebhookConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlatformConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bot_token: String,
    #[serde(default)]
    pub multi_bot_enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_bot_tokens: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupsConfig {
    pub support_group_id: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_group_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admin_user_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetConfig {
    pub failure_threshold: u32,
    pub recovery_check_interval_secs: u64,
    pub auto_failover_enabled: bool,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub global_requests_per_window: u32,
    pub window_secs: u64,
    pub punishment_duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KvConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    pub path: String,
    pub bind_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub health_check_port: u16,
    pub enable_metrics_server: bool,
    pub metrics_endpoint: String,
    pub health_endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_dir = home_dir.join(".support_broker");

        Self {
            platform: PlatformConfig {
                bot_token: String::new(),
                multi_bot_enabled: false,
                additional_bot_tokens: Vec::new(),
            },
            groups: GroupsConfig {
                support_group_id: 0,
                external_group_ids: Vec::new(),
                admin_user_ids: Vec::new(),
            },
            fleet: FleetConfig {
                failure_threshold: 3,
                recovery_check_interval_secs: 30,
                auto_failover_enabled: true,
                heartbeat_interval_secs: 15,
            },
            rate_limit: RateLimitConfig {
                global_requests_per_window: 30,
                window_secs: 30,
                punishment_duration_secs: 60,
            },
            store: StoreConfig {
                db_path: data_dir.join("broker.db"),
                max_connections: 5,
            },
            kv: KvConfig { redis_url: None },
            webhook: WebhookConfig {
                path: "/webhook".to_string(),
                bind_addr: "0.0.0.0:8081".to_string(),
                public_base_url: None,
            },
            monitoring: MonitoringConfig {
                health_check_port: 8080,
                enable_metrics_server: true,
                metrics_endpoint: "/metrics".to_string(),
                health_endpoint: "/health".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_dir = Self::get_config_dir();
        let config_file = config_dir.join("config.toml");

        fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed to create config directory: {}", config_dir.display()))?;

        let mut config = if config_file.exists() {
            info!("loading configuration from {}", config_file.display());
            let content = fs::read_to_string(&config_file)
                .with_context(|| format!("failed to read config file: {}", config_file.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", config_file.display()))?
        } else {
            warn!("config file not found, writing defaults");
            let default_config = Self::default();
            default_config.save(&config_file)?;
            default_config
        };

        config.load_from_env()?;
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let mut content = String::new();
        content.push_str("# Support broker configuration\n");
        content.push_str("#\n");
        content.push_str("# Sensitive values (bot token, group/user ids) should come from the\n");
        content.push_str("# environment rather than this file:\n");
        content.push_str("#   BOT_TOKEN=\"...\"\n");
        content.push_str("#   SUPPORT_GROUP_ID=\"-100...\"\n");
        content.push_str("#   ADMIN_USER_IDS=\"123,456\"\n");
        content.push_str("#   EXTERNAL_GROUP_IDS=\"-100111,-100222\"\n");
        content.push_str("#   REDIS_URL=\"redis://127.0.0.1:6379\"\n");
        content.push('\n');

        let config_content = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        content.push_str(&config_content);

        fs::write(path, content).with_context(|| format!("failed to write config file: {}", path.display()))?;
        info!("configuration saved to {}", path.display());
        Ok(())
    }

    fn load_from_env(&mut self) -> Result<()> {
        if let Ok(token) = std::env::var("BOT_TOKEN") {
            if !token.is_empty() {
                self.platform.bot_token = token;
            }
        }
        if let Ok(v) = std::env::var("MULTI_BOT_ENABLED") {
            self.platform.multi_bot_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(tokens) = std::env::var("ADDITIONAL_BOT_TOKENS") {
            self.platform.additional_bot_tokens =
                tokens.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(v) = std::env::var("SUPPORT_GROUP_ID") {
            self.groups.support_group_id = v.parse().with_context(|| "SUPPORT_GROUP_ID must be an integer")?;
        }
        if let Ok(v) = std::env::var("EXTERNAL_GROUP_IDS") {
            self.groups.external_group_ids = parse_i64_list(&v, "EXTERNAL_GROUP_IDS")?;
        }
        if let Ok(v) = std::env::var("ADMIN_USER_IDS") {
            self.groups.admin_user_ids = parse_i64_list(&v, "ADMIN_USER_IDS")?;
        }
        if let Ok(v) = std::env::var("BOT_FAILURE_THRESHOLD") {
            self.fleet.failure_threshold = v.parse().with_context(|| "BOT_FAILURE_THRESHOLD must be an integer")?;
        }
        if let Ok(v) = std::env::var("BOT_RECOVERY_CHECK_INTERVAL") {
            self.fleet.recovery_check_interval_secs =
                v.parse().with_context(|| "BOT_RECOVERY_CHECK_INTERVAL must be an integer")?;
        }
        if let Ok(v) = std::env::var("AUTO_FAILOVER_ENABLED") {
            self.fleet.auto_failover_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_REQUESTS") {
            self.rate_limit.global_requests_per_window =
                v.parse().with_context(|| "RATE_LIMIT_REQUESTS must be an integer")?;
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_WINDOW") {
            self.rate_limit.window_secs = v.parse().with_context(|| "RATE_LIMIT_WINDOW must be an integer")?;
        }
        if let Ok(v) = std::env::var("WEBHOOK_PATH") {
            self.webhook.path = v;
        }
        if let Ok(v) = std::env::var("PUBLIC_BASE_URL") {
            self.webhook.public_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("DB_PATH") {
            self.store.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.kv.redis_url = Some(v);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.platform.bot_token.is_empty() {
            bail!("BOT_TOKEN is required.\n\nexport BOT_TOKEN=\"your_bot_token_here\"");
        }
        if self.groups.support_group_id == 0 {
            bail!("SUPPORT_GROUP_ID is required.\n\nexport SUPPORT_GROUP_ID=\"-100...\"");
        }
        if !self.store.db_path.is_absolute() {
            bail!("store.db_path must be an absolute path");
        }
        Ok(())
    }

    pub fn get_config_dir() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".support_broker")
    }
}

fn parse_i64_list(raw: &str, var_name: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().with_context(|| format!("{var_name} must be a comma-separated list of integers")))
        .collect()
}
