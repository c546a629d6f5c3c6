//! Configuration for the server

use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{http::HttpConfig, store::StoreConfig};

const DEFAULT_METRICS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9117);

/// Secret used by [`Config::default`]. Only suitable for local development.
pub const DEV_SECRET: &str = "dev-secret";

/// Environment variable overriding the HTTP bind address.
pub const ENV_HOST: &str = "DOCSTORE_HOST";
/// Environment variable overriding the HTTP port.
pub const ENV_PORT: &str = "DOCSTORE_PORT";
/// Environment variable overriding the shared secret.
pub const ENV_SECRET: &str = "DOCSTORE_SECRET";

/// Server configuration
///
/// The config is usually loaded from a file with [`Self::load`].
///
/// The struct also implements [`Default`] which creates a config suitable for local development
/// and testing.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Secret that clients must send with every write request.
    pub secret: String,
    /// Config for the HTTP server
    #[serde(default)]
    pub http: HttpConfig,
    /// Which store backend to use
    #[serde(default)]
    pub store: StoreConfig,
    /// Config for the metrics server.
    ///
    /// The metrics server is started by default. To disable the metrics server, set to
    /// `Some(MetricsConfig::disabled())`.
    pub metrics: Option<MetricsConfig>,
}

/// The config for the metrics server.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Set to true to disable the metrics server.
    pub disabled: bool,
    /// Optionally set a custom address to bind to.
    pub bind_addr: Option<SocketAddr>,
}

impl MetricsConfig {
    /// Disable the metrics server.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            bind_addr: None,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        Self::from_toml(&s)
    }

    /// Parse the config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s).context("invalid config")?;
        Ok(config)
    }

    /// Apply the `DOCSTORE_*` environment variables on top of this config.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(host) = var(ENV_HOST) {
            let addr = host
                .parse::<IpAddr>()
                .with_context(|| format!("{ENV_HOST} is not an IP address: {host:?}"))?;
            self.http.bind_addr = Some(addr);
        }
        if let Some(port) = var(ENV_PORT) {
            self.http.port = port
                .parse::<u16>()
                .with_context(|| format!("{ENV_PORT} is not a port: {port:?}"))?;
        }
        if let Some(secret) = var(ENV_SECRET) {
            self.secret = secret;
        }
        if self.secret == DEV_SECRET {
            warn!("using the development secret, set {ENV_SECRET} or `secret` in the config");
        }
        Ok(self)
    }

    /// Get the address where the metrics server should be bound, if set.
    pub(crate) fn metrics_addr(&self) -> Option<SocketAddr> {
        match &self.metrics {
            None => Some(DEFAULT_METRICS_ADDR),
            Some(conf) => match conf.disabled {
                true => None,
                false => Some(conf.bind_addr.unwrap_or(DEFAULT_METRICS_ADDR)),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: DEV_SECRET.to_string(),
            http: HttpConfig::default(),
            store: StoreConfig::Memory,
            metrics: None,
        }
    }
}
