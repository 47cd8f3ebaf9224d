use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub bind_addr: String,
    pub attempts: AttemptsConfig,
    pub outbox: OutboxConfig,
}

/// Tuning for the attempt lifecycle and the expiry worker.
#[derive(Debug, Clone, Deserialize)]
pub struct AttemptsConfig {
    /// Added on top of the computed deadline before scheduling.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: i64,
    /// Hard upper bound on any attempt's lifetime.
    #[serde(default = "default_ttl_ceiling_secs")]
    pub ttl_ceiling_secs: i64,
    /// Lower bound so a deadline already in the past is still picked up on
    /// the next tick.
    #[serde(default = "default_min_ttl_secs")]
    pub min_ttl_secs: i64,
    #[serde(default = "default_expiry_interval_secs")]
    pub expiry_interval_secs: u64,
    #[serde(default = "default_expiry_batch_size")]
    pub expiry_batch_size: usize,
    #[serde(default = "default_deadline_key")]
    pub deadline_key: String,
}

/// Tuning for the outbox publisher.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_publish_interval_secs")]
    pub publish_interval_secs: u64,
    #[serde(default = "default_publish_batch_size")]
    pub publish_batch_size: i64,
    /// A publishing lease older than this is treated as a crashed publisher
    /// and reclaimed.
    #[serde(default = "default_stale_lease_secs")]
    pub stale_lease_secs: i64,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: i64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: i64,
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
}

fn default_grace_period_secs() -> i64 {
    5
}
fn default_ttl_ceiling_secs() -> i64 {
    14_400
}
fn default_min_ttl_secs() -> i64 {
    1
}
fn default_expiry_interval_secs() -> u64 {
    1
}
fn default_expiry_batch_size() -> usize {
    100
}
fn default_deadline_key() -> String {
    "attempt:deadlines".to_string()
}
fn default_publish_interval_secs() -> u64 {
    1
}
fn default_publish_batch_size() -> i64 {
    50
}
fn default_stale_lease_secs() -> i64 {
    60
}
fn default_backoff_base_secs() -> i64 {
    2
}
fn default_backoff_cap_secs() -> i64 {
    300
}
fn default_stream_prefix() -> String {
    "events".to_string()
}

impl Default for AttemptsConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            ttl_ceiling_secs: default_ttl_ceiling_secs(),
            min_ttl_secs: default_min_ttl_secs(),
            expiry_interval_secs: default_expiry_interval_secs(),
            expiry_batch_size: default_expiry_batch_size(),
            deadline_key: default_deadline_key(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            publish_interval_secs: default_publish_interval_secs(),
            publish_batch_size: default_publish_batch_size(),
            stale_lease_secs: default_stale_lease_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            stream_prefix: default_stream_prefix(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load environment variables from root .env file (two levels up)
        // Try root .env first, then fallback to local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            // Fallback to current directory .env for backward compatibility
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let config_builder = config::Config::builder()
            .add_source(
                config::File::with_name(&format!("config/{}", env)).required(false), // Allow missing config file, fallback to ENV
            )
            // Override with environment variables (prefix: APP_)
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings = config_builder.build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017/quizbench".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "quizbench".to_string());

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let attempts = settings
            .get::<AttemptsConfig>("attempts")
            .unwrap_or_default();
        let outbox = settings.get::<OutboxConfig>("outbox").unwrap_or_default();

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            bind_addr,
            attempts,
            outbox,
        })
    }
}
