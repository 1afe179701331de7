use std::time::Duration;

use anyhow::Result;
use data_model::{
    query::{DEFAULT_PAGE_SIZE, DEFAULT_POLL_INTERVAL},
    SubscribeOptions,
};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

pub const ENV_PREFIX: &str = "REDUCT_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeConfig {
    pub poll_interval_ms: u64,
    pub page_size: u64,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        SubscribeConfig {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub api_token: Option<String>,
    /// Deadline of every network call; none when unset.
    pub timeout_ms: Option<u64>,
    pub verify_ssl: bool,
    pub subscribe: SubscribeConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            url: "http://127.0.0.1:8383".to_string(),
            api_token: None,
            timeout_ms: None,
            verify_ssl: true,
            subscribe: SubscribeConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Load from a YAML file. Missing keys keep their defaults.
    pub fn from_path(path: &str) -> Result<ClientConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ClientConfig = Figment::from(Serialized::defaults(ClientConfig::default()))
            .merge(Yaml::string(&config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `REDUCT_*` environment variables, e.g. `REDUCT_URL` or
    /// `REDUCT_SUBSCRIBE__PAGE_SIZE`.
    pub fn from_env() -> Result<ClientConfig> {
        let config: ClientConfig = Figment::from(Serialized::defaults(ClientConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| anyhow::anyhow!("invalid url {}: {}", self.url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow::anyhow!(
                "url must use http or https, got {}",
                url.scheme()
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(anyhow::anyhow!("timeout_ms must be greater than 0"));
        }
        if self.subscribe.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "subscribe.poll_interval_ms must be greater than 0"
            ));
        }
        if self.subscribe.page_size == 0 {
            return Err(anyhow::anyhow!("subscribe.page_size must be greater than 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Subscription options seeded with the configured poll interval and
    /// page size.
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            poll_interval: Duration::from_millis(self.subscribe.poll_interval_ms),
            page_size: self.subscribe.page_size,
            timeout: self.timeout(),
            ..Default::default()
        }
    }
}
