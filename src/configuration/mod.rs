//! `Configuration`, grounded on `data_loader::configuration::Configuration`:
//! one nested struct per concern, built through `config::Config::builder()`
//! layering a TOML file under an `Environment` source, with owned-value
//! accessor methods rather than public fields.

use anyhow::Result;
use config::{Config, Environment};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct HotCacheConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub url: String,
    pub database_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    pub bind_address: String,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub signing_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AntiSnipingDefaults {
    pub window_ms: i64,
    pub extension_ms: i64,
    pub max_extensions: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub countdown_interval_ms: u64,
    pub sync_drain_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusExporterConfig {
    pub bind_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    hot_cache: HotCacheConfig,
    ledger: LedgerConfig,
    socket: SocketConfig,
    auth: AuthConfig,
    rate_limit: RateLimitConfig,
    anti_sniping_defaults: AntiSnipingDefaults,
    scheduler: SchedulerConfig,
    prometheus_exporter: PrometheusExporterConfig,
}

impl Configuration {
    pub fn new(filename: &str) -> Result<Self> {
        Ok(Config::builder()
            .add_source(config::File::with_name(filename))
            .add_source(
                Environment::with_prefix("AE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Configuration>()?)
    }

    pub fn get_hot_cache_config(&self) -> &HotCacheConfig {
        &self.hot_cache
    }

    pub fn get_ledger_config(&self) -> &LedgerConfig {
        &self.ledger
    }

    pub fn get_socket_config(&self) -> &SocketConfig {
        &self.socket
    }

    pub fn get_auth_config(&self) -> &AuthConfig {
        &self.auth
    }

    pub fn get_rate_limit_config(&self) -> &RateLimitConfig {
        &self.rate_limit
    }

    pub fn get_anti_sniping_defaults(&self) -> &AntiSnipingDefaults {
        &self.anti_sniping_defaults
    }

    pub fn get_scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    pub fn get_prometheus_exporter_bind_address(&self) -> String {
        self.prometheus_exporter.bind_address.clone()
    }
}
