use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;
use tracing::warn;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to build upstream HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub idle_timeout: Duration,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone)]
pub enum UpstreamConfig {
    OpenAi(OpenAiSettings),
    Mock,
    /// No usable credential; every request reports `NotConfigured`.
    Missing,
}

#[derive(Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for OpenAiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiSettings")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = read("RELAY_BIND_ADDR")
            .and_then(|value| match value.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(error) => {
                    warn!(value = %value, error = %error, "ignoring invalid RELAY_BIND_ADDR");
                    None
                }
            })
            .unwrap_or_else(|| {
                DEFAULT_BIND_ADDR
                    .parse()
                    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)))
            });

        let idle_timeout = Duration::from_secs(
            read("RELAY_IDLE_TIMEOUT_SECS")
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
        );

        let upstream = match read("RELAY_UPSTREAM").as_deref() {
            Some("mock") => UpstreamConfig::Mock,
            Some("openai") | None => match read("OPENAI_API_KEY") {
                Some(api_key) => UpstreamConfig::OpenAi(OpenAiSettings {
                    api_key,
                    base_url: read("OPENAI_BASE_URL")
                        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_owned()),
                    model: read("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_owned()),
                    connect_timeout: Duration::from_secs(
                        read("OPENAI_CONNECT_TIMEOUT_SECS")
                            .and_then(|value| value.parse::<u64>().ok())
                            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
                    ),
                }),
                None => UpstreamConfig::Missing,
            },
            Some(other) => {
                warn!(value = %other, "unknown RELAY_UPSTREAM, upstream left unconfigured");
                UpstreamConfig::Missing
            }
        };

        Self {
            bind_addr,
            idle_timeout,
            upstream,
        }
    }
}
