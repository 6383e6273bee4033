//! Configuration types and loading logic.

use std::net::SocketAddr;

use aiolos_tracing::TracingConfig;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use reqwest::Url;
use serde::Deserialize;

use crate::coap::DEFAULT_MAX_MESSAGE_SIZE;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// CoAP listener and admin endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// UDP address the CoAP listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// TCP address for `/health` and `/api/stats`. Disabled when absent.
    #[serde(default)]
    pub admin_address: Option<String>,

    /// How long in-flight requests may run after shutdown is requested.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

/// Telemetry backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL every target path is appended to. Required.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("backend.base_url is required (set it in the config file, AIOLOS_BACKEND__BASE_URL or --backend-url)")]
    MissingBackendUrl,
    #[error("backend.base_url `{url}` is not a valid URL: {source}")]
    InvalidBackendUrl {
        url: String,
        #[source]
        source: <Url as std::str::FromStr>::Err,
    },
    #[error("server.listen_address `{0}` is not a socket address")]
    InvalidListenAddress(String),
    #[error("backend.timeout_secs must be greater than zero")]
    ZeroTimeout,
}

fn default_listen_address() -> String {
    "0.0.0.0:5683".to_string()
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_max_datagram_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            admin_address: None,
            shutdown_grace_secs: default_shutdown_grace(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (AIOLOS_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    ///
    /// A missing file is treated as empty.
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(config_path))
                .merge(Env::prefixed("AIOLOS_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        Ok(figment.extract()?)
    }

    /// Replace the port of `server.listen_address`, keeping its host.
    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        let mut addr = self.listen_addr()?;
        addr.set_port(port);
        self.server.listen_address = addr.to_string();
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .listen_address
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(self.server.listen_address.clone()))
    }

    pub fn backend_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .backend
            .base_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingBackendUrl)?;
        Url::parse(raw).map_err(|source| ConfigError::InvalidBackendUrl {
            url: raw.to_string(),
            source,
        })
    }

    /// Check everything that must hold before the gateway serves traffic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend_url()?;
        self.listen_addr()?;
        if self.backend.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> GatewayConfig {
        GatewayConfig::from_figment(Figment::new().merge(Toml::string(toml))).unwrap()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("");
        assert_eq!(config.server.listen_address, "0.0.0.0:5683");
        assert_eq!(config.server.admin_address, None);
        assert_eq!(config.server.shutdown_grace_secs, 10);
        assert_eq!(config.server.max_datagram_size, 1152);
        assert_eq!(config.backend.timeout_secs, 10);
        assert_eq!(config.tracing.log_level, "info");
    }

    #[test]
    fn missing_backend_url_is_fatal() {
        let config = parse("");
        assert!(matches!(config.validate(), Err(ConfigError::MissingBackendUrl)));

        let config = parse("[backend]\nbase_url = \"  \"");
        assert!(matches!(config.validate(), Err(ConfigError::MissingBackendUrl)));
    }

    #[test]
    fn unparsable_backend_url_is_fatal() {
        let config = parse("[backend]\nbase_url = \"not a url\"");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackendUrl { .. })
        ));
    }

    #[test]
    fn full_config_parses() {
        let config = parse(
            r#"
            [server]
            listen_address = "127.0.0.1:15683"
            admin_address = "127.0.0.1:8080"
            shutdown_grace_secs = 3

            [backend]
            base_url = "http://telemetry:3000"
            timeout_secs = 30

            [tracing]
            log_level = "debug"
            format = "json"
            otlp_endpoint = "http://collector:4317"
            "#,
        );
        config.validate().unwrap();
        assert_eq!(config.listen_addr().unwrap().port(), 15683);
        assert_eq!(config.server.admin_address.as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(config.backend_url().unwrap().as_str(), "http://telemetry:3000/");
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(config.tracing.otlp_endpoint.as_deref(), Some("http://collector:4317"));
        assert_eq!(config.tracing.format, aiolos_tracing::LogFormat::Json);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = parse("[backend]\nbase_url = \"http://b\"\ntimeout_secs = 0");
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTimeout)));
    }

    #[test]
    fn set_port_keeps_host() {
        let mut config = parse("[server]\nlisten_address = \"127.0.0.1:5683\"");
        config.set_port(5700).unwrap();
        assert_eq!(config.server.listen_address, "127.0.0.1:5700");

        let mut bad = parse("[server]\nlisten_address = \"localhost\"");
        assert!(matches!(
            bad.set_port(1),
            Err(ConfigError::InvalidListenAddress(_))
        ));
    }
}
