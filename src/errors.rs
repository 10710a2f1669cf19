//! Centralised error type for the exporter.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("HTTP error fetching {0}: {1}")]
    Transport(String, #[source] reqwest::Error),

    #[error("Bad response code from {0}: {1}")]
    UpstreamStatus(String, reqwest::StatusCode),

    #[error("Decode error for {0}: {1}")]
    Decode(String, #[source] serde_json::Error),

    #[error("Could not parse API URL {0}: {1}")]
    InvalidUrl(String, #[source] url::ParseError),

    #[error("Cannot continue without an API key")]
    MissingApiKey,

    #[error("API period of {0} seconds is out of range")]
    InvalidPeriod(u64),

    #[error("Invalid listen address {0}: {1}")]
    InvalidListenAddress(String, #[source] std::net::AddrParseError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("HTTP server error: {0}")]
    Server(#[from] hyper::Error),
}
