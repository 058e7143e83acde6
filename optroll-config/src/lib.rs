//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeConfig {
    #[serde(default = "default_testnet")]
    pub testnet: bool,
    /// Overrides the testnet/mainnet REST endpoint when set.
    #[serde(default)]
    pub rest_url: Option<String>,
    /// Overrides the testnet/mainnet websocket endpoint when set.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_recv_window")]
    pub recv_window: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamSettings {
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_job_queue_capacity")]
    pub job_queue_capacity: usize,
    #[serde(default = "default_leg2_retry_delay_secs")]
    pub leg2_retry_delay_secs: u64,
    #[serde(default = "default_expiry_grace_secs")]
    pub expiry_grace_secs: i64,
    #[serde(default = "default_aggressive_limit_slippage")]
    pub aggressive_limit_slippage: Decimal,
}

/// One per-tenant API key entry, referenced by tasks via `credential_id`.
#[derive(Debug, Deserialize, Clone)]
pub struct CredentialEntry {
    pub id: i64,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            testnet: default_testnet(),
            rest_url: None,
            ws_url: None,
            http_timeout_secs: default_http_timeout_secs(),
            recv_window: default_recv_window(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            output_capacity: default_output_capacity(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            job_queue_capacity: default_job_queue_capacity(),
            leg2_retry_delay_secs: default_leg2_retry_delay_secs(),
            expiry_grace_secs: default_expiry_grace_secs(),
            aggressive_limit_slippage: default_aggressive_limit_slippage(),
        }
    }
}

impl ExchangeConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl StreamSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl EngineSettings {
    pub fn leg2_retry_delay(&self) -> Duration {
        Duration::from_secs(self.leg2_retry_delay_secs)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9200".into()
}

fn default_testnet() -> bool {
    true
}

fn default_http_timeout_secs() -> u64 {
    5
}

fn default_recv_window() -> u64 {
    5_000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/tasks.db")
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_output_capacity() -> usize {
    100
}

fn default_worker_pool_size() -> usize {
    5
}

fn default_job_queue_capacity() -> usize {
    100
}

fn default_leg2_retry_delay_secs() -> u64 {
    3
}

fn default_expiry_grace_secs() -> i64 {
    300
}

fn default_aggressive_limit_slippage() -> Decimal {
    Decimal::new(20, 2)
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `OPTROLL_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("OPTROLL")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let engine = EngineSettings::default();
        assert_eq!(engine.worker_pool_size, 5);
        assert_eq!(engine.job_queue_capacity, 100);
        assert_eq!(engine.leg2_retry_delay(), Duration::from_secs(3));
        assert_eq!(engine.expiry_grace_secs, 300);
        assert_eq!(engine.aggressive_limit_slippage, Decimal::new(20, 2));

        let stream = StreamSettings::default();
        assert_eq!(stream.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(stream.ping_interval(), Duration::from_secs(20));
        assert_eq!(stream.output_capacity, 100);

        let exchange = ExchangeConfig::default();
        assert_eq!(exchange.http_timeout(), Duration::from_secs(5));
        assert!(exchange.testnet);
    }
}
