//! Type-safe configuration loader using the `config` crate,
//! with manual environment-variable overrides for core settings.

use config::{Config, ConfigError, File};
use serde::Deserialize;
use chrono::Utc;
use std::{env, net::SocketAddr, time::Duration};
use url::Url;

use crate::errors::ExporterError;
use crate::scraper::ScrapeWindow;

/// Top-level exporter settings: built-in defaults, then `Config.toml`,
/// then environment variables.
#[derive(Deserialize, Clone)]
pub struct Settings {
    /// NewRelic REST API key, sent as `X-Api-Key`
    pub api_key: String,

    /// Base URL of the NewRelic API
    pub api_server: String,

    /// Width of the queried window and aggregation period, in seconds
    pub api_period: u64,

    /// Timeout applied to every upstream request (e.g. "5s", "1m")
    #[serde(with = "humantime_serde")]
    pub api_timeout: Duration,

    /// Bind address for the metrics server; ":9126" means all interfaces
    pub listen_address: String,

    /// Path under which the metrics are exposed
    pub metrics_path: String,
}

// The API key stays out of the logs.
impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &"<redacted>")
            .field("api_server", &self.api_server)
            .field("api_period", &self.api_period)
            .field("api_timeout", &self.api_timeout)
            .field("listen_address", &self.listen_address)
            .field("metrics_path", &self.metrics_path)
            .finish()
    }
}

impl Settings {
    /// Load settings from `Config.toml` (if present),
    /// then apply any overrides from these environment variables:
    ///
    /// - `NEWRELIC_API_KEY`
    /// - `NEWRELIC_API_SERVER`
    /// - `NEWRELIC_API_PERIOD`
    /// - `NEWRELIC_API_TIMEOUT`
    /// - `NEWRELIC_LISTEN_ADDRESS`
    /// - `NEWRELIC_METRICS_PATH`
    pub fn new() -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .set_default("api_key", "")?
            .set_default("api_server", "https://api.newrelic.com")?
            .set_default("api_period", 60_i64)?
            .set_default("api_timeout", "5s")?
            .set_default("listen_address", ":9126")?
            .set_default("metrics_path", "/metrics")?
            .add_source(File::with_name("Config").required(false))
            .build()?;

        let mut settings: Settings = cfg.try_deserialize()?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = env::var("NEWRELIC_API_KEY") {
            self.api_key = val;
        }
        if let Ok(val) = env::var("NEWRELIC_API_SERVER") {
            self.api_server = val;
        }
        if let Ok(val) = env::var("NEWRELIC_API_PERIOD") {
            self.api_period = val
                .parse()
                .map_err(|e| ConfigError::Foreign(Box::new(e)))?;
        }
        if let Ok(val) = env::var("NEWRELIC_API_TIMEOUT") {
            self.api_timeout =
                humantime::parse_duration(&val).map_err(|e| ConfigError::Foreign(Box::new(e)))?;
        }
        if let Ok(val) = env::var("NEWRELIC_LISTEN_ADDRESS") {
            self.listen_address = val;
        }
        if let Ok(val) = env::var("NEWRELIC_METRICS_PATH") {
            self.metrics_path = val;
        }
        Ok(())
    }

    /// Fail fast on settings the exporter cannot run without.
    pub fn validate(&self) -> Result<Url, ExporterError> {
        if self.api_key.trim().is_empty() {
            return Err(ExporterError::MissingApiKey);
        }
        if ScrapeWindow::try_ending_at(Utc::now(), self.api_period).is_none() {
            return Err(ExporterError::InvalidPeriod(self.api_period));
        }
        Url::parse(&self.api_server)
            .map_err(|e| ExporterError::InvalidUrl(self.api_server.clone(), e))
    }

    /// Resolve `listen_address` into a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ExporterError> {
        let addr = if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        };
        addr.parse()
            .map_err(|e| ExporterError::InvalidListenAddress(self.listen_address.clone(), e))
    }
}
