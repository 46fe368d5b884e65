use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl StoreBackend {
    fn from_env() -> Self {
        match env::var("SYNTH_RELAY_STORE")
            .unwrap_or_else(|_| "memory".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "redis" => StoreBackend::Redis,
            _ => StoreBackend::Memory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub redis_url: Option<String>,
    pub queue_ttl_seconds: u64,
    pub controller_prefix: String,
    pub idle_timeout_seconds: u64,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("SYNTH_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            store_backend: StoreBackend::from_env(),
            redis_url: env::var("REDIS_URL").ok(),
            queue_ttl_seconds: env::var("QUEUE_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(defaults.queue_ttl_seconds),
            controller_prefix: env::var("CONTROLLER_PREFIX")
                .unwrap_or(defaults.controller_prefix),
            idle_timeout_seconds: env::var("IDLE_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.idle_timeout_seconds),
            log_filter: env::var("RUST_LOG").unwrap_or(defaults.log_filter),
        }
    }

    pub fn queue_ttl(&self) -> Duration {
        Duration::from_secs(self.queue_ttl_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            store_backend: StoreBackend::Memory,
            redis_url: None,
            queue_ttl_seconds: 300, // 5 minutes
            controller_prefix: "controller-".to_string(),
            idle_timeout_seconds: 120,
            log_filter: "info".to_string(),
        }
    }
}
