/*
[INPUT]:  YAML configuration file, command line overrides
[OUTPUT]: Parsed watch configuration and the client configuration derived from it
[POS]:    Configuration layer - watcher setup
[UPDATE]: When adding new configuration options
*/

use std::time::Duration;

use anyhow::Context;
use order_notify_client::{ClientConfig, RetryConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the order watcher
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchConfig {
    /// Notification server base URL (ws:// or wss://)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Optional scope passed when connecting (e.g. a restaurant id)
    #[serde(default)]
    pub scope: Option<String>,
    /// Order ids to watch
    #[serde(default)]
    pub orders: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Reconnection settings in YAML-friendly units
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            namespace: default_namespace(),
            scope: None,
            orders: Vec::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry: RetrySettings::default(),
        }
    }
}

fn default_endpoint() -> String {
    ClientConfig::default().endpoint
}

fn default_namespace() -> String {
    ClientConfig::default().namespace
}

fn default_connect_timeout_ms() -> u64 {
    duration_ms(ClientConfig::default().connect_timeout)
}

fn default_max_attempts() -> u32 {
    RetryConfig::default().max_attempts
}

fn default_base_delay_ms() -> u64 {
    duration_ms(RetryConfig::default().base_delay)
}

fn default_max_delay_ms() -> u64 {
    duration_ms(RetryConfig::default().max_delay)
}

fn default_jitter() -> f64 {
    RetryConfig::default().jitter
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl WatchConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.merge_orders(std::iter::empty());
        Ok(config)
    }

    /// Merge extra order ids into `orders`, trimming blanks and duplicates
    /// from both sources while keeping first-seen order
    pub fn merge_orders<I>(&mut self, extra: I)
    where
        I: IntoIterator<Item = String>,
    {
        let existing = std::mem::take(&mut self.orders);
        for order_id in existing.into_iter().chain(extra) {
            let order_id = order_id.trim().to_string();
            if !order_id.is_empty() && !self.orders.contains(&order_id) {
                self.orders.push(order_id);
            }
        }
    }

    /// Build and validate the client configuration
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let config = ClientConfig {
            endpoint: self.endpoint.clone(),
            namespace: self.namespace.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retry: RetryConfig {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: self.retry.jitter,
            },
            ..ClientConfig::default()
        };
        config.validate().context("invalid client configuration")?;
        Ok(config)
    }
}
