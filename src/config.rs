use crate::duration::{parse_duration, DurationError};
use std::env;
use std::time::Duration;

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Field manager used for every server-side apply issued by the operator.
pub const FIELD_MANAGER: &str = "grafana-operator";

/// Output format of the log subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Operator-wide settings, read once at startup.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Restrict all watches to one namespace; `None` watches the whole cluster.
    pub watch_namespace: Option<String>,
    /// Resync period for resources that do not set `spec.resyncPeriod`.
    pub default_resync_period: Duration,
    /// Timeout for requests against Grafana and remote dashboard sources.
    pub http_timeout: Duration,
    /// Address of the diagnostics and metrics server.
    pub bind_address: String,
    pub log_format: LogFormat,
    /// OTLP collector, only used with the `telemetry` feature.
    pub otlp_endpoint: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            default_resync_period: DEFAULT_RESYNC_PERIOD,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            log_format: LogFormat::default(),
            otlp_endpoint: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name}: {source}")]
    InvalidDuration {
        name: &'static str,
        #[source]
        source: DurationError,
    },

    #[error("LOG_FORMAT must be `compact` or `json`, got `{0}`")]
    InvalidLogFormat(String),
}

impl OperatorConfig {
    /// Read the configuration from the process environment.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a local `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let duration = |name: &'static str, fallback: Duration| match non_empty(name) {
            None => Ok(fallback),
            Some(value) => {
                parse_duration(&value).map_err(|source| ConfigError::InvalidDuration { name, source })
            }
        };

        let log_format = match non_empty("LOG_FORMAT").as_deref().map(str::to_lowercase) {
            None => LogFormat::Compact,
            Some(f) if f == "compact" => LogFormat::Compact,
            Some(f) if f == "json" => LogFormat::Json,
            Some(other) => return Err(ConfigError::InvalidLogFormat(other)),
        };

        Ok(Self {
            watch_namespace: non_empty("WATCH_NAMESPACE"),
            default_resync_period: duration("DEFAULT_RESYNC_PERIOD", defaults.default_resync_period)?,
            http_timeout: duration("GRAFANA_HTTP_TIMEOUT", defaults.http_timeout)?,
            bind_address: non_empty("HTTP_BIND_ADDRESS").unwrap_or(defaults.bind_address),
            log_format,
            otlp_endpoint: non_empty("OPENTELEMETRY_ENDPOINT_URL"),
        })
    }

    pub fn user_agent(&self) -> String {
        format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}
