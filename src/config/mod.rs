//! Service configuration.
//!
//! Precedence, lowest first: built-in defaults, the TOML file (`--config`
//! or `NSQDELAY_CONFIG`), `NSQDELAY_*` environment variables, and finally
//! command-line flags (applied by the binary).

use std::time::Duration;
use std::{env, fs, path::Path};

use serde::Deserialize;
use thiserror::Error;

use crate::core::message::is_valid_topic_name;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub lookupd_http_addresses: Vec<String>,
    pub nsqd_tcp_address: String,
    pub source_topic: String,
    pub channel: String,
    pub max_in_flight: u32,
    pub lookupd_poll_interval_ms: u64,
    pub publish_timeout_ms: u64,
    pub dial_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            lookupd_http_addresses: vec!["http://127.0.0.1:4161".to_string()],
            nsqd_tcp_address: "127.0.0.1:4150".to_string(),
            source_topic: "delayed".to_string(),
            channel: "nsqdelay_scheduler".to_string(),
            max_in_flight: 32,
            lookupd_poll_interval_ms: 60_000,
            publish_timeout_ms: 5_000,
            dial_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub redis_address: String,
    pub key_prefix: String,
    pub max_active: usize,
    pub max_idle: usize,
    /// 0 disables idle recycling.
    pub idle_timeout_secs: u64,
    pub checkout_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_address: "127.0.0.1:6379".to_string(),
            key_prefix: "nsqdelay_".to_string(),
            max_active: 1000,
            max_idle: 50,
            idle_timeout_secs: 3600,
            checkout_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScannerConfig {
    pub interval_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngressConfig {
    pub max_concurrency: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self { max_concurrency: 64 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EgressConfig {
    pub queue_capacity: usize,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// 0 retries forever.
    pub max_attempts: u32,
    pub max_pending_retries: usize,
    pub dead_letter_capacity: usize,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
            max_attempts: 0,
            max_pending_retries: 1024,
            dead_letter_capacity: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub scanner: ScannerConfig,
    pub ingress: IngressConfig,
    pub egress: EgressConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Loads the file named by `path` or `NSQDELAY_CONFIG` (if any) and
    /// applies environment overrides. Does not validate.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let env_path = env::var("NSQDELAY_CONFIG").ok();
        let effective_path = path.map(|s| s.to_string()).or(env_path);

        let mut cfg = match effective_path {
            Some(p) => Self::load_file(p)?,
            None => Config::default(),
        };
        cfg.apply_env_from(|key| env::var(key).ok());
        Ok(cfg)
    }

    /// Applies `NSQDELAY_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NSQDELAY_LOOKUPD_HTTP_ADDRESSES") {
            self.broker.lookupd_http_addresses = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(v) = lookup("NSQDELAY_NSQD_TCP_ADDRESS") {
            self.broker.nsqd_tcp_address = v;
        }

        if let Some(v) = lookup("NSQDELAY_REDIS_ADDRESS") {
            self.store.redis_address = v;
        }

        if let Some(v) = lookup("NSQDELAY_TOPIC") {
            self.broker.source_topic = v;
        }

        if let Some(v) = lookup("NSQDELAY_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_string()))
        }

        let b = &self.broker;
        if b.nsqd_tcp_address.trim().is_empty() {
            return invalid("broker.nsqd_tcp_address is empty");
        }
        if !is_valid_topic_name(&b.source_topic) {
            return Err(ConfigError::Invalid(format!(
                "broker.source_topic {:?} is not a valid topic name",
                b.source_topic
            )));
        }
        if b.channel.trim().is_empty() {
            return invalid("broker.channel is empty");
        }
        if b.max_in_flight == 0 {
            return invalid("broker.max_in_flight must be positive");
        }
        if b.lookupd_poll_interval_ms == 0 || b.publish_timeout_ms == 0 || b.dial_timeout_ms == 0 {
            return invalid("broker intervals and timeouts must be positive");
        }

        let s = &self.store;
        if s.redis_address.trim().is_empty() {
            return invalid("store.redis_address is empty");
        }
        if s.max_active == 0 {
            return invalid("store.max_active must be positive");
        }
        if s.checkout_timeout_ms == 0 {
            return invalid("store.checkout_timeout_ms must be positive");
        }

        if self.scanner.interval_ms == 0 {
            return invalid("scanner.interval_ms must be positive");
        }
        if self.ingress.max_concurrency == 0 {
            return invalid("ingress.max_concurrency must be positive");
        }

        let e = &self.egress;
        if e.queue_capacity == 0 || e.max_pending_retries == 0 || e.dead_letter_capacity == 0 {
            return invalid("egress capacities must be positive");
        }
        if e.retry_base_ms == 0 {
            return invalid("egress.retry_base_ms must be positive");
        }
        if e.retry_max_ms < e.retry_base_ms {
            return invalid("egress.retry_max_ms must be at least egress.retry_base_ms");
        }

        if self.shutdown.timeout_ms == 0 {
            return invalid("shutdown.timeout_ms must be positive");
        }
        Ok(())
    }
}

impl BrokerConfig {
    pub fn lookupd_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lookupd_poll_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

impl StoreConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

impl ScannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl EgressConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Reads and validates a TOML file, without environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let config = Config::load_file(path)?;
    config.validate()?;
    Ok(config)
}
