//! Tracing configuration types.

use serde::Deserialize;

/// The `[tracing]` section of the gateway config.
#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    /// Reported as `service.name` on exported spans.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Collector endpoint, e.g. "http://collector:4317". Unset means no export.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    #[serde(default)]
    pub protocol: OtlpProtocol,

    /// `EnvFilter` directives, e.g. "info" or "aiolos_gateway=debug,info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log line format on stderr.
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

/// `text` for humans at a terminal, `json` for log shippers.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_service_name() -> String {
    "aiolos-gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
            protocol: OtlpProtocol::default(),
            log_level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
