//! Environment-driven configuration, in the style of the old `DbConfig`:
//! every field has an env var with a sane default, loaded once at startup.

use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/join_coordinator".to_string()),
            max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            min_connections: env_or("DB_MIN_CONNECTIONS", 2),
            acquire_timeout: Duration::from_secs(env_or("DB_ACQUIRE_TIMEOUT_SECS", 30)),
            idle_timeout: Duration::from_secs(env_or("DB_IDLE_TIMEOUT_SECS", 600)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub amqp_url: String,
    pub exchange: String,
    /// Routing keys the inbox consumer subscribes to.
    pub consumed_routing_keys: Vec<String>,
    pub prefetch: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            amqp_url: std::env::var("AMQP_URL")
                .unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string()),
            exchange: std::env::var("AMQP_EXCHANGE")
                .unwrap_or_else(|_| "events".to_string()),
            consumed_routing_keys: vec![
                "event.published".to_string(),
                "event.updated".to_string(),
                "event.canceled".to_string(),
            ],
            prefetch: env_or("AMQP_PREFETCH", 10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub reservation: Duration,
    pub max_attempts: i32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub confirm_timeout: Duration,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(env_or("OUTBOX_POLL_INTERVAL_MS", 500)),
            batch_size: env_or("OUTBOX_BATCH_SIZE", 20),
            reservation: Duration::from_secs(env_or("OUTBOX_RESERVATION_SECS", 15)),
            max_attempts: env_or("OUTBOX_MAX_ATTEMPTS", 12),
            min_backoff: Duration::from_secs(env_or("OUTBOX_MIN_BACKOFF_SECS", 5)),
            max_backoff: Duration::from_secs(env_or("OUTBOX_MAX_BACKOFF_SECS", 1800)),
            confirm_timeout: Duration::from_millis(env_or("OUTBOX_CONFIRM_TIMEOUT_MS", 300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    pub sweep_interval: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(env_or("IDEMPOTENCY_SWEEP_INTERVAL_SECS", 3600)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub db: DbConfig,
    pub broker: BrokerConfig,
    pub relay: OutboxRelayConfig,
    pub housekeeping: HousekeepingConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db: DbConfig::default(),
            broker: BrokerConfig::default(),
            relay: OutboxRelayConfig::default(),
            housekeeping: HousekeepingConfig::default(),
        }
    }
}
