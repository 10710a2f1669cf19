//! Library entrypoint: re‑export modules

pub mod client;
pub mod config;
pub mod errors;
pub mod exporter;
pub mod metrics;
pub mod model;
pub mod scraper;
pub mod server;
