/*
[INPUT]:  Endpoint, namespace, timeouts and reconnection settings
[OUTPUT]: Validated client configuration and resolved session URLs
[POS]:    Configuration layer - shared by transport and connection manager
[UPDATE]: When adding connection options or changing defaults
*/

use std::time::Duration;

use url::Url;

use crate::error::{NotifyError, Result};

/// Default notification endpoint
const DEFAULT_ENDPOINT: &str = "ws://localhost:3000";
const DEFAULT_NAMESPACE: &str = "orders";
const SCOPE_QUERY_KEY: &str = "scope";

/// Reconnection settings
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Reconnect attempts after a transport drop before giving up
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Randomization factor in `[0, 1]`; 0 disables jitter
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: 0.5,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base `ws://` or `wss://` URL of the notification server
    pub endpoint: String,
    pub namespace: String,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
    /// Capacity of the per-session inbound and outbound channels
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            connect_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            channel_capacity: 100,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for an endpoint, keeping other defaults
    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        let config = Self {
            endpoint: endpoint.to_string(),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check settings that would otherwise fail late inside the worker
    pub fn validate(&self) -> Result<()> {
        let endpoint = Url::parse(&self.endpoint)?;
        match endpoint.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(NotifyError::Config(format!(
                    "endpoint scheme must be ws or wss, got {other}"
                )));
            }
        }
        if self.channel_capacity == 0 {
            return Err(NotifyError::Config(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(NotifyError::Config(format!(
                "retry jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(NotifyError::Config(
                "retry base_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the session URL for the namespace and optional scope
    pub fn session_url(&self, scope_id: Option<&str>) -> Result<Url> {
        let namespace = self.namespace.trim_matches('/');
        let mut base = Url::parse(&self.endpoint)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let mut url = if namespace.is_empty() {
            base
        } else {
            base.join(namespace)?
        };
        if let Some(scope) = scope_id {
            url.query_pairs_mut().append_pair(SCOPE_QUERY_KEY, scope);
        }
        Ok(url)
    }
}
